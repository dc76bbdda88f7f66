//! Run archive: everything a pipeline run produced, written under
//! `.colloquy/runs/<timestamp>_<id>/`.
//!
//! ```text
//! runs/2026-03-01T10-15-00_1a2b3c4d/
//!   report.json        status, stage reached, chart outcomes, warnings
//!   document.md        final (or best partial) draft
//!   transcripts.json   every session and code loop transcript
//!   references.json    the reference set
//!   figures/           chart images referenced by document.md
//!   papers/            full text of cited papers that offered a PDF
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::code_loop::LoopState;
use crate::pipeline::{ChartReport, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub charts: Vec<ChartAudit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downloads: Vec<DownloadReport>,
}

impl RunReport {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            outcome: RunOutcome::InProgress,
            charts: Vec::new(),
            warnings: Vec::new(),
            downloads: Vec::new(),
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Settings the run was started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub topic: String,
    pub project_dir: PathBuf,
    pub model_command: String,
    pub perspectives: usize,
    pub rounds: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub charts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    InProgress,
    Completed,
    Cancelled { stage: Stage },
    Failed { stage: Stage, error: String },
}

impl RunOutcome {
    /// Last stage the run entered, if it stopped early.
    pub fn stage_reached(&self) -> Option<Stage> {
        match self {
            Self::Cancelled { stage } | Self::Failed { stage, .. } => Some(*stage),
            Self::InProgress | Self::Completed => None,
        }
    }
}

/// One chart's loop result, without the code and figure payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartAudit {
    pub title: String,
    pub state: LoopState,
    pub attempts_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl From<&ChartReport> for ChartAudit {
    fn from(report: &ChartReport) -> Self {
        Self {
            title: report.title.clone(),
            state: report.state,
            attempts_used: report.attempts_used,
            error: report.error.clone(),
            cancelled: report.cancelled,
        }
    }
}

pub mod download;
pub mod logger;
pub use download::{DownloadReport, DownloadStatus, PdfDownloader};
pub use logger::RunArchive;

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            topic: "soil".to_string(),
            project_dir: PathBuf::from("."),
            model_command: "claude".to_string(),
            perspectives: 3,
            rounds: 2,
            max_attempts: 3,
            inputs: Vec::new(),
            charts: Vec::new(),
        }
    }

    #[test]
    fn test_run_report_new() {
        let report = RunReport::new(config());
        assert!(report.ended_at.is_none());
        assert_eq!(report.outcome, RunOutcome::InProgress);
        assert!(report.duration_secs().is_none());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::Failed {
            stage: Stage::Charts,
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "charts");
        assert_eq!(outcome.stage_reached(), Some(Stage::Charts));
        assert_eq!(RunOutcome::Completed.stage_reached(), None);
    }
}
