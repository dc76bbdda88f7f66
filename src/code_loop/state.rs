//! State machine types for the code-iteration loop.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capability::ExecutionResult;
use crate::transcript::Transcript;

/// Where a code loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Writer is producing a candidate. Each entry consumes one attempt.
    Writing,
    /// Code reviewer is checking the candidate.
    Reviewing,
    /// Sandbox is running the candidate.
    Executing,
    /// Execution succeeded. Terminal.
    Succeeded,
    /// Attempts exhausted (or cancelled). Terminal.
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving to `next` is a legal edge.
    pub fn can_transition_to(&self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Writing, Reviewing)
                | (Writing, Writing)
                | (Writing, Failed)
                | (Reviewing, Executing)
                | (Reviewing, Writing)
                | (Reviewing, Failed)
                | (Executing, Succeeded)
                | (Executing, Writing)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Writing => "WRITING",
            Self::Reviewing => "REVIEWING",
            Self::Executing => "EXECUTING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// One edge taken by the loop. The first entry into WRITING has no `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub attempt: u32,
    pub from: Option<LoopState>,
    pub to: LoopState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Final result of a code loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub state: LoopState,
    /// Last candidate the writer produced.
    pub code: Option<String>,
    /// Result of the last execution. When nothing was executed this is a
    /// synthetic failure describing why.
    pub result: ExecutionResult,
    pub attempts_used: u32,
    pub transitions: Vec<Transition>,
    pub transcript: Transcript,
    #[serde(default)]
    pub cancelled: bool,
}

impl LoopOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == LoopState::Succeeded
    }

    /// How many times the loop entered WRITING.
    pub fn writing_entries(&self) -> usize {
        self.transitions.iter().filter(|t| t.to == LoopState::Writing).count()
    }

    /// How many candidates reached the sandbox.
    pub fn executions(&self) -> usize {
        self.transitions.iter().filter(|t| t.to == LoopState::Executing).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(LoopState::Succeeded.is_terminal());
        assert!(LoopState::Failed.is_terminal());
        assert!(!LoopState::Writing.is_terminal());
        assert!(!LoopState::Executing.is_terminal());
    }

    #[test]
    fn test_legal_edges() {
        assert!(LoopState::Writing.can_transition_to(LoopState::Reviewing));
        assert!(LoopState::Reviewing.can_transition_to(LoopState::Writing));
        assert!(LoopState::Executing.can_transition_to(LoopState::Succeeded));
        assert!(!LoopState::Writing.can_transition_to(LoopState::Executing));
        assert!(!LoopState::Reviewing.can_transition_to(LoopState::Succeeded));
        assert!(!LoopState::Succeeded.can_transition_to(LoopState::Writing));
        assert!(!LoopState::Failed.can_transition_to(LoopState::Writing));
    }

    #[test]
    fn test_display_uppercase() {
        assert_eq!(LoopState::Executing.to_string(), "EXECUTING");
        assert_eq!(
            serde_json::to_string(&LoopState::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }
}
