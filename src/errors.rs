//! Typed error hierarchy for the colloquy orchestrator.
//!
//! Recoverable errors are absorbed where they occur:
//! - `AgentInvocationError` becomes an empty message for that round
//! - `ExecutionFailure` becomes feedback for the next writing attempt
//!
//! Fatal errors propagate upward:
//! - `ConvergenceFailure` ends a dialogue session
//! - `PipelineStageFailure` wraps any fatal error with the stage and the
//!   artifacts produced before it

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{PartialArtifacts, Stage};
use crate::transcript::Transcript;

/// Failures raised by the external capabilities (model, search, sandbox).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Language model timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("Literature search failed: {0}")]
    SearchFailed(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),
}

/// A single agent's invocation failed. Recoverable: the agent's turn becomes a no-op.
#[derive(Debug, Clone, Error)]
#[error("Agent {agent} failed in round {round}: {source}")]
pub struct AgentInvocationError {
    pub agent: String,
    pub round: u32,
    #[source]
    pub source: CapabilityError,
}

/// The arbiter or the resolver could not produce a decision. Fatal to the session.
#[derive(Debug, Clone, Error)]
#[error("Convergence failed in session '{session}' at round {round}: {reason}")]
pub struct ConvergenceFailure {
    pub session: String,
    pub round: u32,
    pub reason: String,
    /// Everything recorded before the failure, kept for audit.
    pub transcript: Transcript,
}

/// Why a sandbox run did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionFailure {
    #[error("Execution timed out")]
    Timeout,

    #[error("Process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Failed to spawn sandbox process: {0}")]
    Spawn(String),

    #[error("Sandbox I/O error: {0}")]
    Io(String),

    #[error("Rejected by code reviewer: {0}")]
    Rejected(String),
}

/// Transcript append-order violation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("Message from {sender} (round {round}) would break transcript order")]
    OutOfOrder { sender: String, round: u32 },
}

/// Fatal error raised inside one pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Convergence(#[from] ConvergenceFailure),

    #[error("Seed drafting failed: {0}")]
    SeedDraft(#[source] CapabilityError),

    #[error("Seed draft response could not be parsed: {0}")]
    SeedParse(String),

    #[error("Chart '{title}' failed after {attempts} attempt(s): {detail}")]
    ChartFailed {
        title: String,
        attempts: u32,
        detail: String,
    },

    #[error("Input error: {0}")]
    Input(String),
}

/// A fatal failure with the stage it happened in and every artifact produced before it.
#[derive(Debug, Error)]
#[error("Pipeline failed at stage {stage}: {source}")]
pub struct PipelineStageFailure {
    pub stage: Stage,
    #[source]
    pub source: StageError,
    pub partial: Box<PartialArtifacts>,
}

impl PipelineStageFailure {
    pub fn new(stage: Stage, source: impl Into<StageError>, partial: PartialArtifacts) -> Self {
        Self {
            stage,
            source: source.into(),
            partial: Box::new(partial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_error_messages_are_readable() {
        let err = CapabilityError::ModelTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Language model timed out after 30s");

        let err = CapabilityError::ModelUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn agent_invocation_error_exposes_source() {
        use std::error::Error as _;
        let err = AgentInvocationError {
            agent: "reviewer-2".to_string(),
            round: 1,
            source: CapabilityError::ModelUnavailable("down".to_string()),
        };
        assert!(err.to_string().contains("reviewer-2"));
        assert!(err.source().is_some());
    }

    #[test]
    fn execution_failure_serializes_tagged() {
        let json = serde_json::to_string(&ExecutionFailure::Timeout).unwrap();
        assert_eq!(json, r#"{"kind":"timeout"}"#);

        let failure = ExecutionFailure::NonZeroExit {
            code: 1,
            stderr: "boom".to_string(),
        };
        let json = serde_json::to_string(&failure).unwrap();
        let back: ExecutionFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn stage_failure_carries_stage_name() {
        let failure = PipelineStageFailure::new(
            Stage::Charts,
            StageError::ChartFailed {
                title: "ph curve".to_string(),
                attempts: 3,
                detail: "timeout".to_string(),
            },
            PartialArtifacts::default(),
        );
        let msg = failure.to_string();
        assert!(msg.contains("charts"));
        assert!(msg.contains("ph curve"));
    }
}
