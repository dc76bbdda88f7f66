//! Full-text download for the papers a run cited.
//!
//! Every paper with a `pdf_link` is fetched into the run's `papers/`
//! directory, a bounded number at a time. A download never fails the run:
//! each paper ends with a [`DownloadStatus`] recorded in `report.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capability::search::Retry;
use crate::references::PaperRecord;

pub const PAPERS_DIR: &str = "papers";

const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Saved as `file`, relative to the run directory.
    Downloaded { file: PathBuf, bytes: u64 },
    Forbidden,
    NotFound,
    /// The server answered, but not with a PDF.
    NotPdf { content_type: String },
    Failed { error: String },
}

impl DownloadStatus {
    pub fn is_downloaded(&self) -> bool {
        matches!(self, Self::Downloaded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReport {
    pub source_id: String,
    pub url: String,
    #[serde(flatten)]
    pub status: DownloadStatus,
}

#[derive(Debug, Clone)]
pub struct PdfDownloader {
    client: reqwest::Client,
    concurrency: usize,
    max_retries: u32,
    backoff_base: Duration,
}

impl PdfDownloader {
    pub fn new(timeout: Duration, concurrency: usize, max_retries: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            concurrency: concurrency.max(1),
            max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Download every paper that has a PDF link into `dir`. Reports are
    /// sorted by source id; papers without a link are not reported.
    pub async fn download_all<'a>(
        &self,
        papers: impl IntoIterator<Item = &'a PaperRecord>,
        dir: &Path,
    ) -> Vec<DownloadReport> {
        let jobs: Vec<(String, String)> = papers
            .into_iter()
            .filter_map(|p| p.pdf_link.clone().map(|url| (p.source_id.clone(), url)))
            .collect();
        if jobs.is_empty() {
            return Vec::new();
        }

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            let error = format!("failed to create {}: {}", dir.display(), e);
            return jobs
                .into_iter()
                .map(|(source_id, url)| DownloadReport {
                    source_id,
                    url,
                    status: DownloadStatus::Failed { error: error.clone() },
                })
                .collect();
        }

        let mut reports: Vec<DownloadReport> = stream::iter(jobs)
            .map(|(source_id, url)| async move {
                let status = self.download_one(&source_id, &url, dir).await;
                tracing::debug!(%source_id, %url, ?status, "pdf download");
                DownloadReport { source_id, url, status }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let downloaded = reports.iter().filter(|r| r.status.is_downloaded()).count();
        tracing::info!(requested = reports.len(), downloaded, "pdf downloads finished");
        reports
    }

    async fn download_one(&self, source_id: &str, url: &str, dir: &Path) -> DownloadStatus {
        let mut retry = Retry::new(self.backoff_base, self.max_retries);

        loop {
            let response = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/pdf")
                .send()
                .await;

            let reason = match response {
                Ok(resp) if resp.status().is_success() => {
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown")
                        .to_string();
                    return match resp.bytes().await {
                        Ok(body) if body.starts_with(PDF_MAGIC) => save_pdf(source_id, url, &body, dir).await,
                        Ok(_) => DownloadStatus::NotPdf { content_type },
                        Err(e) => DownloadStatus::Failed {
                            error: format!("failed to read body: {}", e),
                        },
                    };
                }
                Ok(resp) if resp.status() == StatusCode::FORBIDDEN => return DownloadStatus::Forbidden,
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return DownloadStatus::NotFound,
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error() => {
                    format!("HTTP {}", resp.status())
                }
                Ok(resp) => {
                    return DownloadStatus::Failed {
                        error: format!("HTTP {}", resp.status()),
                    };
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => format!("request failed: {}", e),
                Err(e) => {
                    return DownloadStatus::Failed {
                        error: format!("request failed: {}", e),
                    };
                }
            };

            if let Err(error) = retry.wait_or_fail(reason).await {
                return DownloadStatus::Failed { error };
            }
        }
    }
}

async fn save_pdf(source_id: &str, url: &str, body: &[u8], dir: &Path) -> DownloadStatus {
    let name = pdf_file_name(source_id, url);
    let path = dir.join(&name);
    match tokio::fs::write(&path, body).await {
        Ok(()) => DownloadStatus::Downloaded {
            file: PathBuf::from(PAPERS_DIR).join(name),
            bytes: body.len() as u64,
        },
        Err(e) => DownloadStatus::Failed {
            error: format!("failed to write {}: {}", path.display(), e),
        },
    }
}

/// `<source id slug>_<url hash>.pdf`. The hash keeps ids that slugify
/// alike apart.
fn pdf_file_name(source_id: &str, url: &str) -> String {
    let slug: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .take(80)
        .collect();
    let slug = slug.trim_matches(['_', '.']);
    let slug = if slug.is_empty() { "document" } else { slug };

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}.pdf", slug, &digest[..8])
}
