//! Versioned document state.
//!
//! A [`DraftArtifact`] is never edited in place once published: every
//! convergence or assembly step calls [`DraftArtifact::next_version`] and edits
//! the new value, which records its parent version. The chain of versions is
//! therefore a singly linked revision history.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::references::PaperRecord;
use crate::transcript::QuestionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub body: String,
}

impl Section {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// What a chart loop produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FigureArtifact {
    /// Image file copied out of the sandbox scratch directory.
    Image(PathBuf),
    /// Captured stdout when no image was produced.
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Figure {
    pub title: String,
    pub caption: String,
    pub artifact: FigureArtifact,
}

/// A reviewer question resolved by the arbiter, with the papers that back it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub question: QuestionId,
    pub papers: Vec<PaperRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftArtifact {
    pub version: u32,
    pub parent: Option<u32>,
    pub title: String,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub figures: Vec<Figure>,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl DraftArtifact {
    /// First version of a document. Has no parent.
    pub fn seed(title: impl Into<String>, sections: Vec<Section>) -> Self {
        Self {
            version: 1,
            parent: None,
            title: title.into(),
            sections,
            figures: Vec::new(),
            citations: Vec::new(),
        }
    }

    /// Copy of this draft as the next version in the chain.
    pub fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            parent: Some(self.version),
            ..self.clone()
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Replace the body of a section with a matching name, or append a new one.
    pub fn upsert_section(&mut self, name: &str, body: impl Into<String>) {
        let body = body.into();
        match self
            .sections
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name.trim()))
        {
            Some(existing) => existing.body = body,
            None => self.sections.push(Section::new(name.trim(), body)),
        }
    }

    /// Record a citation. A repeated question id replaces the earlier entry.
    pub fn cite(&mut self, question: QuestionId, papers: Vec<PaperRecord>) {
        if papers.is_empty() {
            return;
        }
        match self.citations.iter_mut().find(|c| c.question == question) {
            Some(existing) => existing.papers = papers,
            None => self.citations.push(Citation { question, papers }),
        }
    }

    pub fn add_figure(&mut self, figure: Figure) {
        self.figures.push(figure);
    }

    /// Unique cited papers in first-citation order.
    pub fn bibliography(&self) -> Vec<&PaperRecord> {
        let mut seen = std::collections::HashSet::new();
        self.citations
            .iter()
            .flat_map(|c| c.papers.iter())
            .filter(|p| seen.insert(p.source_id.as_str()))
            .collect()
    }

    /// Render as markdown. Output depends only on the draft's contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", self.title);

        for section in &self.sections {
            let _ = writeln!(out, "## {}\n", section.name);
            if !section.body.trim().is_empty() {
                let _ = writeln!(out, "{}\n", section.body.trim_end());
            }
        }

        if !self.figures.is_empty() {
            let _ = writeln!(out, "## Figures\n");
            for (i, figure) in self.figures.iter().enumerate() {
                let _ = writeln!(out, "### Figure {}: {}\n", i + 1, figure.title);
                match &figure.artifact {
                    FigureArtifact::Image(path) => {
                        let _ = writeln!(out, "![{}]({})\n", figure.title, path.display());
                    }
                    FigureArtifact::Text(text) => {
                        let _ = writeln!(out, "```text\n{}\n```\n", text.trim_end());
                    }
                }
                if !figure.caption.is_empty() {
                    let _ = writeln!(out, "*{}*\n", figure.caption);
                }
            }
        }

        let bibliography = self.bibliography();
        if !bibliography.is_empty() {
            let _ = writeln!(out, "## References\n");
            for (i, paper) in bibliography.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, paper.citation_line());
            }
            out.push('\n');
        }

        out
    }
}
