//! External capabilities the orchestrator calls through narrow interfaces.
//!
//! - [`LanguageModel`]: structured prompt in, text out
//! - [`LiteratureSearch`]: query in, ordered paper records out
//! - [`SandboxedExecutor`]: code in, [`ExecutionResult`] out
//!
//! Real adapters live in the submodules. Tests substitute deterministic stubs.

pub mod arxiv;
pub mod model;
pub mod sandbox;
pub mod search;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::errors::{CapabilityError, ExecutionFailure};
use crate::references::PaperRecord;

pub use arxiv::ArxivSearch;
pub use model::CliModel;
pub use sandbox::{ProcessSandbox, SandboxConfig};
pub use search::{DisabledSearch, ScholarSearch};

/// One prior turn visible to the agent being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub speaker: String,
    pub content: String,
}

/// Structured prompt for a single agent turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Name of the invoking agent, for logging and stub routing.
    pub agent: String,
    pub role: AgentRole,
    pub system: String,
    pub history: Vec<HistoryTurn>,
    pub instruction: String,
}

impl ModelRequest {
    /// Flatten into a single prompt for text-only backends.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.system);
        prompt.push_str("\n\n");
        if !self.history.is_empty() {
            prompt.push_str("## Conversation so far\n\n");
            for turn in &self.history {
                prompt.push_str(&format!("[{}]\n{}\n\n", turn.speaker, turn.content.trim_end()));
            }
        }
        prompt.push_str("## Your task\n\n");
        prompt.push_str(&self.instruction);
        prompt.push('\n');
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
}

impl ModelResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Fails with `ModelUnavailable` or `ModelTimeout`.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, CapabilityError>;
}

#[async_trait]
pub trait LiteratureSearch: Send + Sync {
    /// Ordered results. "No results" is `Ok(vec![])`, never an error.
    async fn search(&self, query: &str) -> Result<Vec<PaperRecord>, CapabilityError>;
}

#[async_trait]
pub trait SandboxedExecutor: Send + Sync {
    /// Run `code` in isolation. Implementations must return within `timeout`
    /// plus a bounded grace period; callers enforce that bound regardless.
    async fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult;

    /// Release what a run left behind once the caller has copied out its
    /// artifact. Failed runs are cleaned up by `execute` itself.
    fn cleanup(&self, _result: &ExecutionResult) {}
}

/// Outcome of one sandbox run. Consumed by the code loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    /// First image produced in the scratch directory, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, artifact: Option<PathBuf>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            artifact,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(error: ExecutionFailure, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: output.into(),
            artifact: None,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::failure(ExecutionFailure::Timeout, "", duration_ms)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(ExecutionFailure::Timeout))
    }

    /// Text handed back to the writer after a failed run.
    pub fn feedback(&self) -> String {
        match &self.error {
            Some(err) if self.output.trim().is_empty() => err.to_string(),
            Some(err) => format!("{}\n\nOutput:\n{}", err, self.output.trim_end()),
            None => self.output.clone(),
        }
    }
}

/// The three capabilities a pipeline run needs.
#[derive(Clone)]
pub struct Capabilities {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn LiteratureSearch>,
    pub executor: Arc<dyn SandboxedExecutor>,
}

impl Capabilities {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn LiteratureSearch>,
        executor: Arc<dyn SandboxedExecutor>,
    ) -> Self {
        Self {
            model,
            search,
            executor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prompt_sections() {
        let req = ModelRequest {
            agent: "reviewer-01".into(),
            role: AgentRole::Reviewer,
            system: "You review.".into(),
            history: vec![HistoryTurn {
                speaker: "arbiter".into(),
                content: "Seed outline".into(),
            }],
            instruction: "Ask one question.".into(),
        };
        let prompt = req.render_prompt();
        assert!(prompt.starts_with("You review."));
        assert!(prompt.contains("[arbiter]\nSeed outline"));
        assert!(prompt.ends_with("## Your task\n\nAsk one question.\n"));
    }

    #[test]
    fn test_render_prompt_without_history() {
        let req = ModelRequest {
            agent: "a".into(),
            role: AgentRole::Writer,
            system: "S".into(),
            history: vec![],
            instruction: "I".into(),
        };
        assert!(!req.render_prompt().contains("Conversation so far"));
    }

    #[test]
    fn test_execution_result_feedback() {
        let r = ExecutionResult::failure(
            ExecutionFailure::NonZeroExit {
                code: 1,
                stderr: "NameError".into(),
            },
            "partial",
            10,
        );
        assert!(!r.success);
        let fb = r.feedback();
        assert!(fb.contains("NameError"));
        assert!(fb.contains("Output:\npartial"));

        let t = ExecutionResult::timeout(5);
        assert!(t.is_timeout());
        assert_eq!(t.feedback(), "Execution timed out");
    }
}
