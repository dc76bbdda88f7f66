//! Input file discovery and classification.
//!
//! | kind | extensions | handling |
//! |------|------------|----------|
//! | prior references | `*.refs.json` | JSON array of paper records, seeded into the reference set |
//! | notes | `md`, `txt`, `tex` | read and truncated, shared with every agent |
//! | data | `csv`, `tsv`, `json`, `xlsx` | head shown to agents (`xlsx` by name only) |
//!
//! Anything else, or anything unreadable, becomes a warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::references::PaperRecord;
use crate::util::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Data,
    Notes,
    PriorReferences,
}

/// Classify a path by its extension.
pub fn classify(path: &Path) -> Option<InputKind> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    if name.ends_with(".refs.json") {
        return Some(InputKind::PriorReferences);
    }
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "md" | "txt" | "tex" => Some(InputKind::Notes),
        "csv" | "tsv" | "json" | "xlsx" => Some(InputKind::Data),
        _ => None,
    }
}

/// Expand glob patterns. Literal paths pass through unchanged; patterns with
/// no matches produce a warning.
pub fn expand_patterns(patterns: &[String]) -> (Vec<PathBuf>, Vec<String>) {
    let mut paths = Vec::new();
    let mut warnings = Vec::new();

    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            paths.push(PathBuf::from(pattern));
            continue;
        }
        match glob::glob(pattern) {
            Ok(entries) => {
                let before = paths.len();
                for entry in entries {
                    match entry {
                        Ok(path) if path.is_file() => paths.push(path),
                        Ok(_) => {}
                        Err(e) => warnings.push(format!("{}: {}", pattern, e)),
                    }
                }
                if paths.len() == before {
                    warnings.push(format!("{}: no files matched", pattern));
                }
            }
            Err(e) => warnings.push(format!("{}: invalid pattern: {}", pattern, e)),
        }
    }

    (paths, warnings)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub kind: InputKind,
    /// Truncated text for notes and text data; `None` for binary data.
    pub content: Option<String>,
}

/// All inputs for one run.
#[derive(Debug, Clone, Default)]
pub struct InputBundle {
    pub files: Vec<InputFile>,
    pub prior_references: Vec<PaperRecord>,
    pub warnings: Vec<String>,
}

impl InputBundle {
    /// Read and classify `paths`. Never fails; problems become warnings.
    pub fn load(paths: &[PathBuf], char_budget: usize) -> Self {
        let mut bundle = Self::default();

        for path in paths {
            let Some(kind) = classify(path) else {
                bundle.warn(format!("{}: unsupported input type, skipped", path.display()));
                continue;
            };

            if kind == InputKind::Data && has_extension(path, "xlsx") {
                if path.is_file() {
                    bundle.files.push(InputFile {
                        path: path.clone(),
                        kind,
                        content: None,
                    });
                } else {
                    bundle.warn(format!("{}: file not found", path.display()));
                }
                continue;
            }

            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    bundle.warn(format!("{}: {}", path.display(), e));
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&bytes);

            if kind == InputKind::PriorReferences {
                match serde_json::from_str::<Vec<PaperRecord>>(&text) {
                    Ok(papers) => bundle.prior_references.extend(papers),
                    Err(e) => bundle.warn(format!("{}: invalid reference list: {}", path.display(), e)),
                }
                continue;
            }

            bundle.files.push(InputFile {
                path: path.clone(),
                kind,
                content: Some(truncate_chars(&text, char_budget).to_string()),
            });
        }

        bundle
    }

    fn warn(&mut self, warning: String) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn notes(&self) -> impl Iterator<Item = &InputFile> {
        self.files.iter().filter(|f| f.kind == InputKind::Notes)
    }

    pub fn data(&self) -> impl Iterator<Item = &InputFile> {
        self.files.iter().filter(|f| f.kind == InputKind::Data)
    }

    /// Shared context text for the agents, or `None` when there are no inputs.
    pub fn context(&self) -> Option<String> {
        if self.files.is_empty() && self.prior_references.is_empty() {
            return None;
        }

        let mut out = String::new();
        for file in self.notes() {
            out.push_str(&format!("### Notes: {}\n\n", display_name(&file.path)));
            out.push_str(file.content.as_deref().unwrap_or_default().trim_end());
            out.push_str("\n\n");
        }
        for file in self.data() {
            match &file.content {
                Some(content) => {
                    out.push_str(&format!("### Data: {}\n\n```\n", display_name(&file.path)));
                    out.push_str(content.trim_end());
                    out.push_str("\n```\n\n");
                }
                None => out.push_str(&format!("### Data: {} (binary, not shown)\n\n", display_name(&file.path))),
            }
        }
        if !self.prior_references.is_empty() {
            out.push_str("### Prior references\n\n");
            for paper in &self.prior_references {
                out.push_str(&format!("- {}\n", paper.citation_line()));
            }
        }
        Some(out.trim_end().to_string())
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
