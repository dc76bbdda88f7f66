//! Literature records and the per-run reference set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transcript::QuestionId;

/// One paper returned by literature search. Identity is `source_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub source_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Direct link to the full text, when the source offers one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_link: Option<String>,
}

impl PaperRecord {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        authors: Vec<String>,
        abstract_text: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            authors,
            abstract_text: abstract_text.into(),
            link: None,
            pdf_link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_pdf_link(mut self, link: impl Into<String>) -> Self {
        self.pdf_link = Some(link.into());
        self
    }

    /// One-line bibliography entry.
    pub fn citation_line(&self) -> String {
        let mut line = if self.authors.is_empty() {
            format!("{}.", self.title)
        } else {
            format!("{}. {}.", self.authors.join(", "), self.title)
        };
        if let Some(link) = &self.link {
            line.push_str(&format!(" <{}>", link));
        }
        line
    }
}

/// Mapping from resolved questions to the papers that resolved them.
///
/// Insert-only: questions are never un-resolved and papers are never removed.
/// Papers are deduplicated by source id across the whole set; the first
/// record seen for an id is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    papers: BTreeMap<String, PaperRecord>,
    resolutions: BTreeMap<QuestionId, Vec<String>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add papers to the pool without resolving any question (prior references).
    /// Returns how many were new.
    pub fn add_papers(&mut self, papers: impl IntoIterator<Item = PaperRecord>) -> usize {
        let mut added = 0;
        for paper in papers {
            if !self.papers.contains_key(&paper.source_id) {
                self.papers.insert(paper.source_id.clone(), paper);
                added += 1;
            }
        }
        added
    }

    /// Mark `question` resolved by `papers`. An empty list leaves it unresolved.
    /// Returns how many papers were new to the set.
    pub fn resolve(&mut self, question: &str, papers: Vec<PaperRecord>) -> usize {
        if papers.is_empty() {
            return 0;
        }
        let ids: Vec<String> = papers.iter().map(|p| p.source_id.clone()).collect();
        let added = self.add_papers(papers);
        let entry = self.resolutions.entry(question.to_string()).or_default();
        for id in ids {
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
        added
    }

    /// Number of resolved questions.
    pub fn len(&self) -> usize {
        self.resolutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty()
    }

    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    pub fn is_resolved(&self, question: &str) -> bool {
        self.resolutions.contains_key(question)
    }

    /// Papers that resolved `question`, in resolution order.
    pub fn papers_for(&self, question: &str) -> Vec<PaperRecord> {
        self.resolutions
            .get(question)
            .map(|ids| ids.iter().filter_map(|id| self.papers.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn papers(&self) -> impl Iterator<Item = &PaperRecord> {
        self.papers.values()
    }

    pub fn resolved_questions(&self) -> impl Iterator<Item = &QuestionId> {
        self.resolutions.keys()
    }
}
