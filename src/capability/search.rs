//! Google Scholar search through the SerpApi JSON endpoint, plus the retry
//! policy shared by every HTTP backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::LiteratureSearch;
use crate::errors::CapabilityError;
use crate::references::PaperRecord;

/// Longest wait between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(32);

/// SerpApi's message when a query simply has no hits.
const NO_RESULTS_MARKER: &str = "hasn't returned any results";

#[derive(Debug, Deserialize)]
struct ScholarResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    result_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    publication_info: Option<PublicationInfo>,
    #[serde(default)]
    resources: Vec<Resource>,
}

/// Extra full-text links attached to a result.
#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(default)]
    file_format: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicationInfo {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    authors: Vec<AuthorEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthorEntry {
    name: String,
}

impl OrganicResult {
    fn into_record(self) -> Option<PaperRecord> {
        let title = self.title?;
        let source_id = self
            .result_id
            .or_else(|| self.link.clone())
            .unwrap_or_else(|| title.to_lowercase());

        let authors = match self.publication_info {
            Some(info) if !info.authors.is_empty() => {
                info.authors.into_iter().map(|a| a.name).collect()
            }
            // "A Kim, B Lee - Journal, 2020 - publisher"
            Some(PublicationInfo {
                summary: Some(summary),
                ..
            }) => summary
                .split(" - ")
                .next()
                .map(|names| {
                    names
                        .split(',')
                        .map(|n| n.trim().trim_end_matches('…').trim().to_string())
                        .filter(|n| !n.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let pdf_link = self
            .resources
            .into_iter()
            .filter(|r| r.file_format.as_deref().is_some_and(|f| f.eq_ignore_ascii_case("pdf")))
            .find_map(|r| r.link);

        let mut record = PaperRecord::new(source_id, title, authors, self.snippet.unwrap_or_default());
        if let Some(link) = self.link {
            record = record.with_link(link);
        }
        if let Some(pdf) = pdf_link {
            record = record.with_pdf_link(pdf);
        }
        Some(record)
    }
}

/// Parse a SerpApi body into paper records, keeping at most `limit`.
fn parse_response(body: &str, limit: usize) -> Result<Vec<PaperRecord>, CapabilityError> {
    let response: ScholarResponse = serde_json::from_str(body)
        .map_err(|e| CapabilityError::SearchFailed(format!("invalid response body: {}", e)))?;

    if let Some(error) = response.error {
        if error.contains(NO_RESULTS_MARKER) {
            return Ok(Vec::new());
        }
        return Err(CapabilityError::SearchFailed(error));
    }

    Ok(response
        .organic_results
        .into_iter()
        .filter_map(OrganicResult::into_record)
        .take(limit)
        .collect())
}

/// Exponential backoff: `base * 2^attempt`, capped at 32 seconds.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// Retry budget for one request.
#[derive(Debug)]
pub(crate) struct Retry {
    base: Duration,
    max_retries: u32,
    retries: u32,
}

impl Retry {
    pub(crate) fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            retries: 0,
        }
    }

    /// Sleep before the next try, or give up with `reason` once the budget
    /// is spent.
    pub(crate) async fn wait_or_fail(&mut self, reason: String) -> Result<(), String> {
        if self.retries >= self.max_retries {
            return Err(format!("{} (after {} retries)", reason, self.max_retries));
        }
        let delay = backoff_delay(self.base, self.retries);
        tracing::warn!(retry = self.retries + 1, ?delay, "{}, retrying", reason);
        tokio::time::sleep(delay).await;
        self.retries += 1;
        Ok(())
    }
}

/// `max_results` must be 1 to 100 for every backend.
pub(crate) fn check_max_results(max_results: u32) -> Result<(), CapabilityError> {
    if !(1..=100).contains(&max_results) {
        return Err(CapabilityError::SearchFailed(format!(
            "max_results must be between 1 and 100, got {}",
            max_results
        )));
    }
    Ok(())
}

pub struct ScholarSearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_results: u32,
    max_retries: u32,
    backoff_base: Duration,
}

impl ScholarSearch {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        max_results: u32,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        check_max_results(max_results)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::SearchFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            max_results,
            max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

}

#[async_trait]
impl LiteratureSearch for ScholarSearch {
    async fn search(&self, query: &str) -> Result<Vec<PaperRecord>, CapabilityError> {
        let num = self.max_results.to_string();
        let params = [
            ("engine", "google_scholar"),
            ("q", query),
            ("api_key", self.api_key.as_str()),
            ("num", num.as_str()),
        ];
        let mut retry = Retry::new(self.backoff_base, self.max_retries);

        loop {
            let response = self.client.get(&self.endpoint).query(&params).send().await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp
                        .text()
                        .await
                        .map_err(|e| CapabilityError::SearchFailed(format!("failed to read body: {}", e)))?;
                    let papers = parse_response(&body, self.max_results as usize)?;
                    tracing::debug!(query, results = papers.len(), "scholar search");
                    return Ok(papers);
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    retry
                        .wait_or_fail("rate limited".to_string())
                        .await
                        .map_err(CapabilityError::SearchFailed)?;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(CapabilityError::SearchFailed(format!("HTTP {}: {}", status, text)));
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    retry
                        .wait_or_fail(format!("request failed: {}", e))
                        .await
                        .map_err(CapabilityError::SearchFailed)?;
                }
                Err(e) => {
                    return Err(CapabilityError::SearchFailed(format!("request failed: {}", e)));
                }
            }
        }
    }
}

/// Search that never finds anything. Used when no API key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSearch;

#[async_trait]
impl LiteratureSearch for DisabledSearch {
    async fn search(&self, query: &str) -> Result<Vec<PaperRecord>, CapabilityError> {
        tracing::debug!(query, "literature search disabled");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "search_metadata": {"status": "Success"},
      "organic_results": [
        {
          "position": 0,
          "title": "Soil acidity and crop yield",
          "result_id": "abc123",
          "link": "https://example.org/a",
          "snippet": "We study pH.",
          "publication_info": {
            "summary": "J Kim, B Lee - Soil Science, 2019 - Elsevier",
            "authors": [{"name": "J Kim"}, {"name": "B Lee"}]
          },
          "resources": [
            {"title": "example.org", "file_format": "HTML", "link": "https://example.org/a.html"},
            {"title": "example.org", "file_format": "PDF", "link": "https://example.org/a.pdf"}
          ]
        },
        {
          "position": 1,
          "title": "Liming practices",
          "result_id": "def456",
          "publication_info": {"summary": "A Park, C Cho… - Agronomy, 2021"}
        },
        {"position": 2, "snippet": "no title, skipped"}
      ]
    }"#;

    #[test]
    fn test_parse_response_maps_fields() {
        let papers = parse_response(SAMPLE, 10).unwrap();
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0].source_id, "abc123");
        assert_eq!(papers[0].authors, vec!["J Kim", "B Lee"]);
        assert_eq!(papers[0].abstract_text, "We study pH.");
        assert_eq!(papers[0].link.as_deref(), Some("https://example.org/a"));
        assert_eq!(papers[0].pdf_link.as_deref(), Some("https://example.org/a.pdf"));
        assert_eq!(papers[1].authors, vec!["A Park", "C Cho"]);
        assert!(papers[1].pdf_link.is_none());
    }

    #[test]
    fn test_parse_response_respects_limit() {
        assert_eq!(parse_response(SAMPLE, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_response_no_results_is_empty() {
        let body = r#"{"error": "Google hasn't returned any results for this query."}"#;
        assert!(parse_response(body, 10).unwrap().is_empty());
        assert!(parse_response("{}", 10).unwrap().is_empty());
    }

    #[test]
    fn test_parse_response_api_error() {
        let body = r#"{"error": "Invalid API key."}"#;
        let err = parse_response(body, 10).unwrap_err();
        assert_eq!(err, CapabilityError::SearchFailed("Invalid API key.".to_string()));
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 10), MAX_BACKOFF);
    }

    #[test]
    fn test_max_results_validation() {
        let t = Duration::from_secs(5);
        assert!(ScholarSearch::new("http://localhost", "k", 0, 3, t).is_err());
        assert!(ScholarSearch::new("http://localhost", "k", 101, 3, t).is_err());
        assert!(ScholarSearch::new("http://localhost", "k", 100, 3, t).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_after_retries() {
        let search = ScholarSearch::new("http://127.0.0.1:9/search", "k", 5, 2, Duration::from_secs(2))
            .unwrap()
            .with_backoff_base(Duration::from_millis(1));
        let err = search.search("soil").await.unwrap_err();
        assert!(err.to_string().contains("after 2 retries"));
    }

    #[tokio::test]
    async fn test_disabled_search_returns_empty() {
        assert!(DisabledSearch.search("anything").await.unwrap().is_empty());
    }
}
