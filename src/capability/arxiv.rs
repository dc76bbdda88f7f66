//! arXiv search through the export API's Atom feed.
//!
//! No API key is needed. arXiv asks clients to stay gentle, so rate limiting
//! and unavailable responses back off exponentially like the Scholar backend.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::LiteratureSearch;
use super::search::{Retry, check_max_results};
use crate::errors::CapabilityError;
use crate::references::PaperRecord;

pub const DEFAULT_ENDPOINT: &str = "http://export.arxiv.org/api/query";

/// Ids of the pseudo-entry arXiv returns for a malformed query.
const ERROR_ID_MARKER: &str = "/api/errors";

pub struct ArxivSearch {
    client: reqwest::Client,
    endpoint: String,
    max_results: u32,
    start: u32,
    max_retries: u32,
    backoff_base: Duration,
}

impl ArxivSearch {
    pub fn new(
        endpoint: impl Into<String>,
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
            max_results,
            start: 0,
            max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Offset of the first result (arXiv's `start`).
    pub fn with_start(mut self, start: u32) -> Self {
        self.start = start;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

#[async_trait]
impl LiteratureSearch for ArxivSearch {
    async fn search(&self, query: &str) -> Result<Vec<PaperRecord>, CapabilityError> {
        let search_query = format!("all:{}", query);
        let start = self.start.to_string();
        let max_results = self.max_results.to_string();
        let params = [
            ("search_query", search_query.as_str()),
            ("start", start.as_str()),
            ("max_results", max_results.as_str()),
        ];
        let mut retry = Retry::new(self.backoff_base, self.max_retries);

        loop {
            match self.client.get(&self.endpoint).query(&params).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp
                        .text()
                        .await
                        .map_err(|e| CapabilityError::SearchFailed(format!("failed to read body: {}", e)))?;
                    let mut papers = parse_feed(&body)?;
                    papers.truncate(self.max_results as usize);
                    tracing::debug!(query, results = papers.len(), "arxiv search");
                    return Ok(papers);
                }
                Ok(resp)
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE =>
                {
                    retry
                        .wait_or_fail(format!("arXiv returned {}", resp.status()))
                        .await
                        .map_err(CapabilityError::SearchFailed)?;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(CapabilityError::SearchFailed(format!("HTTP {}: {}", status, text.trim())));
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

/// Fields collected while inside one `<entry>`.
#[derive(Debug, Default)]
struct EntryFields {
    id: String,
    title: String,
    summary: String,
    authors: Vec<String>,
    abs_link: Option<String>,
    pdf_link: Option<String>,
}

impl EntryFields {
    fn add_link(&mut self, element: &BytesStart<'_>) {
        let mut href = None;
        let mut title = None;
        let mut rel = None;
        let mut kind = None;
        for attr in element.attributes().flatten() {
            let value = attr
                .unescape_value()
                .map(Cow::into_owned)
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            match attr.key.local_name().as_ref() {
                b"href" => href = Some(value),
                b"title" => title = Some(value),
                b"rel" => rel = Some(value),
                b"type" => kind = Some(value),
                _ => {}
            }
        }
        let Some(href) = href else {
            return;
        };
        if title.as_deref() == Some("pdf") || kind.as_deref() == Some("application/pdf") {
            self.pdf_link.get_or_insert(href);
        } else if rel.as_deref() == Some("alternate") {
            self.abs_link.get_or_insert(href);
        }
    }

    fn into_record(self) -> Option<PaperRecord> {
        if self.id.is_empty() || self.title.is_empty() {
            return None;
        }
        // "http://arxiv.org/abs/2101.00001v1" -> "arxiv:2101.00001v1"
        let short_id = self.id.rsplit("/abs/").next().unwrap_or(&self.id);
        let link = self.abs_link.unwrap_or_else(|| self.id.clone());
        let mut record = PaperRecord::new(format!("arxiv:{}", short_id), self.title, self.authors, self.summary)
            .with_link(link);
        if let Some(pdf) = self.pdf_link {
            record = record.with_pdf_link(pdf);
        }
        Some(record)
    }
}

fn xml_error(e: impl std::fmt::Display) -> CapabilityError {
    CapabilityError::SearchFailed(format!("invalid Atom feed: {}", e))
}

/// Titles and abstracts wrap across lines in the feed.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an arXiv Atom feed into paper records, in feed order.
fn parse_feed(body: &str) -> Result<Vec<PaperRecord>, CapabilityError> {
    // Untrimmed: text around entity references keeps its spacing and
    // collapse_whitespace tidies it afterwards.
    let mut reader = Reader::from_str(body);

    let mut papers = Vec::new();
    let mut entry: Option<EntryFields> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(element) => {
                let name = element.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"entry" => entry = Some(EntryFields::default()),
                    b"link" => {
                        if let Some(fields) = entry.as_mut() {
                            fields.add_link(&element);
                        }
                    }
                    _ => {}
                }
                text.clear();
                path.push(name);
            }
            Event::Empty(element) => {
                if element.local_name().as_ref() == b"link"
                    && let Some(fields) = entry.as_mut()
                {
                    fields.add_link(&element);
                }
            }
            Event::Text(t) => text.push_str(&String::from_utf8_lossy(&t)),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::GeneralRef(r) => {
                if let Some(ch) = r.resolve_char_ref().map_err(xml_error)? {
                    text.push(ch);
                } else {
                    let name = String::from_utf8_lossy(&r).into_owned();
                    match quick_xml::escape::resolve_predefined_entity(&name) {
                        Some(resolved) => text.push_str(resolved),
                        None => text.push_str(&format!("&{};", name)),
                    }
                }
            }
            Event::End(_) => {
                let name = path.pop().unwrap_or_default();
                let parent = path.last().map(Vec::as_slice);
                if name == b"entry" {
                    if let Some(fields) = entry.take() {
                        if fields.id.contains(ERROR_ID_MARKER) {
                            return Err(CapabilityError::SearchFailed(format!(
                                "arXiv rejected the query: {}",
                                collapse_whitespace(&fields.summary)
                            )));
                        }
                        papers.extend(fields.into_record());
                    }
                } else if let Some(fields) = entry.as_mut() {
                    let value = collapse_whitespace(&text);
                    match (name.as_slice(), parent) {
                        (b"id", Some(b"entry")) => fields.id = value,
                        (b"title", Some(b"entry")) => fields.title = value,
                        (b"summary", Some(b"entry")) => fields.summary = value,
                        (b"name", Some(b"author")) if !value.is_empty() => fields.authors.push(value),
                        _ => {}
                    }
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(papers)
}
