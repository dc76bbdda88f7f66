//! Writer / code reviewer / sandbox iteration.
//!
//! ```text
//! WRITING -> REVIEWING -> EXECUTING -> SUCCEEDED
//!    ^           |            |
//!    +-----------+------------+   (rejection or failed run, while attempts remain)
//! ```
//!
//! Every entry into WRITING consumes one attempt. When a rejection or failed
//! run happens with no attempts left the loop moves to FAILED, carrying the
//! last execution result. `max_attempts` is the only bound on disagreement
//! between writer and reviewer.

pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentId, AgentRole};
use crate::capability::{ExecutionResult, LanguageModel, SandboxedExecutor};
use crate::errors::{ExecutionFailure, TranscriptError};
use crate::pipeline::{PipelineEvent, emit};
use crate::transcript::{Message, Payload, Transcript};
use crate::util::{extract_code_block, extract_json};

pub use state::{LoopOutcome, LoopState, Transition};

const WRITER_PERSONA: &str = "You write self-contained Python scripts that produce publication-quality charts \
with matplotlib. Save the figure into the current working directory (for example chart.png). \
Do not read or write files outside the current directory and do not use the network. \
Reply with a single ```python code block.";

const REVIEWER_PERSONA: &str = "You review plotting scripts for correctness before they are run. \
Check that the script runs without user interaction, saves exactly one figure into the current \
directory, and matches the requested chart. Reply with ONLY a JSON object: \
{\"approved\": true|false, \"feedback\": \"what must change\"}.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_attempts: u32,
    pub execution_timeout: Duration,
    /// Extra time the executor gets past `execution_timeout` before it is abandoned.
    pub grace: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout: Duration::from_secs(60),
            grace: Duration::from_secs(5),
        }
    }
}

/// Code reviewer decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    pub feedback: String,
}

#[derive(Deserialize)]
struct VerdictJson {
    approved: bool,
    #[serde(default)]
    feedback: String,
}

/// Parse a reviewer reply. Anything without a JSON verdict counts as approval
/// with the text kept as advisory feedback.
pub fn parse_verdict(response: &str) -> Verdict {
    extract_json(response)
        .and_then(|json| serde_json::from_str::<VerdictJson>(&json).ok())
        .map(|v| Verdict {
            approved: v.approved,
            feedback: v.feedback,
        })
        .unwrap_or_else(|| Verdict {
            approved: true,
            feedback: response.trim().to_string(),
        })
}

/// One chart's writer/reviewer/executor loop.
pub struct CodeLoop {
    name: String,
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn SandboxedExecutor>,
    settings: LoopSettings,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl CodeLoop {
    pub fn new(
        name: impl Into<String>,
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn SandboxedExecutor>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            name: name.into(),
            model,
            executor,
            settings,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterate until the sandbox accepts a candidate or attempts run out.
    pub async fn run(&self, task: &str) -> LoopOutcome {
        let slug = slug(&self.name);
        let mut writer = Agent::new(AgentId(1), AgentRole::Writer, format!("writer-{}", slug), WRITER_PERSONA);
        let mut reviewer = Agent::new(
            AgentId(2),
            AgentRole::CodeReviewer,
            format!("code-reviewer-{}", slug),
            REVIEWER_PERSONA,
        );

        let mut run = LoopRun::new(&self.name);
        let mut state = LoopState::Writing;
        run.enter(0, None, LoopState::Writing, None);

        let mut code: Option<String> = None;
        let mut feedback: Option<String> = None;
        let mut last_result: Option<ExecutionResult> = None;
        let mut attempts = 0u32;

        while !state.is_terminal() {
            match state {
                LoopState::Writing => {
                    if attempts >= self.settings.max_attempts {
                        run.enter(attempts, Some(state), LoopState::Failed, Some("no attempts allowed".into()));
                        state = LoopState::Failed;
                        continue;
                    }
                    if self.cancel.is_cancelled() {
                        run.cancelled = true;
                        run.enter(attempts, Some(state), LoopState::Failed, Some("cancelled".into()));
                        state = LoopState::Failed;
                        continue;
                    }

                    attempts += 1;
                    emit(
                        &self.event_tx,
                        PipelineEvent::AttemptStarted {
                            chart: self.name.clone(),
                            attempt: attempts,
                            max_attempts: self.settings.max_attempts,
                        },
                    )
                    .await;
                    tracing::debug!(chart = %self.name, attempt = attempts, "writing");

                    let instruction = writer_instruction(task, feedback.as_deref(), code.as_deref());
                    match writer.invoke(self.model.as_ref(), instruction).await {
                        Ok(text) => {
                            let candidate = extract_code_block(&text);
                            let message = Message::text(writer.id(), writer.name(), writer.role(), attempts, &text)
                                .with_payload(Payload::Code {
                                    source: candidate.clone(),
                                });
                            if let Err(err) = run.record(message, &mut writer, &mut reviewer) {
                                state = run.abort(attempts, state, err);
                                continue;
                            }
                            code = Some(candidate);
                            state = run.advance(attempts, state, LoopState::Reviewing, None);
                        }
                        Err(e) => {
                            tracing::warn!(chart = %self.name, attempt = attempts, error = %e, "writer failed");
                            let message =
                                Message::empty(writer.id(), writer.name(), writer.role(), attempts, e.to_string());
                            if let Err(err) = run.record(message, &mut writer, &mut reviewer) {
                                state = run.abort(attempts, state, err);
                                continue;
                            }
                            feedback = Some(format!("The previous attempt could not be written: {}", e));
                            state = self.retry_or_fail(&mut run, attempts, state, e.to_string());
                            self.attempt_finished(attempts, state, Some(e.to_string())).await;
                        }
                    }
                }

                LoopState::Reviewing => {
                    let candidate = code.clone().unwrap_or_default();
                    let instruction = format!(
                        "Task:\n{}\n\nCandidate script:\n```python\n{}\n```\n\nApprove or reject it.",
                        task, candidate
                    );
                    let verdict = match reviewer.invoke(self.model.as_ref(), instruction).await {
                        Ok(text) => {
                            let verdict = parse_verdict(&text);
                            let message = Message::text(reviewer.id(), reviewer.name(), reviewer.role(), attempts, &text)
                                .with_payload(Payload::Verdict {
                                    approved: verdict.approved,
                                    feedback: verdict.feedback.clone(),
                                });
                            if let Err(err) = run.record(message, &mut writer, &mut reviewer) {
                                state = run.abort(attempts, state, err);
                                continue;
                            }
                            verdict
                        }
                        Err(e) => {
                            // A silent reviewer does not block execution.
                            tracing::warn!(chart = %self.name, attempt = attempts, error = %e, "code reviewer failed");
                            let message = Message::empty(
                                reviewer.id(),
                                reviewer.name(),
                                reviewer.role(),
                                attempts,
                                e.to_string(),
                            );
                            if let Err(err) = run.record(message, &mut writer, &mut reviewer) {
                                state = run.abort(attempts, state, err);
                                continue;
                            }
                            Verdict {
                                approved: true,
                                feedback: String::new(),
                            }
                        }
                    };

                    if verdict.approved {
                        state = run.advance(attempts, state, LoopState::Executing, None);
                    } else {
                        let note = format!("rejected: {}", verdict.feedback);
                        feedback = Some(format!("The code reviewer rejected the script:\n{}", verdict.feedback));
                        state = self.retry_or_fail(&mut run, attempts, state, note.clone());
                        if state == LoopState::Failed && last_result.is_none() {
                            last_result = Some(ExecutionResult::failure(
                                ExecutionFailure::Rejected(verdict.feedback.clone()),
                                "",
                                0,
                            ));
                        }
                        self.attempt_finished(attempts, state, Some(note)).await;
                    }
                }

                LoopState::Executing => {
                    let candidate = code.clone().unwrap_or_default();
                    let result = self.execute(&candidate).await;
                    if result.success {
                        tracing::info!(chart = %self.name, attempt = attempts, "chart succeeded");
                        state = run.advance(attempts, state, LoopState::Succeeded, None);
                        self.attempt_finished(attempts, state, None).await;
                    } else {
                        let detail = result.feedback();
                        tracing::info!(chart = %self.name, attempt = attempts, error = %detail, "execution failed");
                        feedback = Some(format!("Running the script failed:\n{}", detail));
                        state = self.retry_or_fail(&mut run, attempts, state, detail.clone());
                        self.attempt_finished(attempts, state, Some(detail)).await;
                    }
                    last_result = Some(result);
                }

                LoopState::Succeeded | LoopState::Failed => {}
            }
        }

        let result = last_result.unwrap_or_else(|| {
            let reason = if run.cancelled {
                "cancelled before any candidate was executed"
            } else {
                "no candidate was executed"
            };
            ExecutionResult::failure(ExecutionFailure::Rejected(reason.to_string()), "", 0)
        });

        LoopOutcome {
            state,
            code,
            result,
            attempts_used: attempts,
            transitions: run.transitions,
            transcript: run.transcript,
            cancelled: run.cancelled,
        }
    }

    /// Back to WRITING if attempts remain, otherwise FAILED.
    fn retry_or_fail(&self, run: &mut LoopRun, attempt: u32, from: LoopState, note: String) -> LoopState {
        let next = if attempt >= self.settings.max_attempts {
            LoopState::Failed
        } else {
            LoopState::Writing
        };
        run.advance(attempt, from, next, Some(note))
    }

    /// Run a candidate, abandoning the executor if it overruns timeout plus grace.
    async fn execute(&self, code: &str) -> ExecutionResult {
        let start = Instant::now();
        let limit = self.settings.execution_timeout + self.settings.grace;
        match tokio::time::timeout(limit, self.executor.execute(code, self.settings.execution_timeout)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(chart = %self.name, ?limit, "executor overran its timeout, abandoning");
                ExecutionResult::timeout(start.elapsed().as_millis() as u64)
            }
        }
    }

    async fn attempt_finished(&self, attempt: u32, state: LoopState, detail: Option<String>) {
        emit(
            &self.event_tx,
            PipelineEvent::AttemptFinished {
                chart: self.name.clone(),
                attempt,
                state,
                detail,
            },
        )
        .await;
    }
}

/// Mutable bookkeeping for one `run` call.
struct LoopRun {
    transitions: Vec<Transition>,
    transcript: Transcript,
    cancelled: bool,
}

impl LoopRun {
    fn new(name: &str) -> Self {
        Self {
            transitions: Vec::new(),
            transcript: Transcript::new(format!("chart:{}", name)),
            cancelled: false,
        }
    }

    fn enter(&mut self, attempt: u32, from: Option<LoopState>, to: LoopState, note: Option<String>) {
        self.transitions.push(Transition { attempt, from, to, note });
    }

    fn advance(&mut self, attempt: u32, from: LoopState, to: LoopState, note: Option<String>) -> LoopState {
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        self.enter(attempt, Some(from), to, note);
        to
    }

    /// Append to the transcript, then let both agents observe the message.
    /// Nobody observes a message the transcript refused.
    fn record(&mut self, message: Message, writer: &mut Agent, reviewer: &mut Agent) -> Result<(), TranscriptError> {
        self.transcript.push(message.clone())?;
        writer.observe(&message);
        reviewer.observe(&message);
        Ok(())
    }

    /// End the loop after a broken append. Rounds are attempt numbers, so
    /// this only happens when the loop itself misnumbers a message.
    fn abort(&mut self, attempt: u32, from: LoopState, err: TranscriptError) -> LoopState {
        tracing::error!(error = %err, attempt, "loop transcript out of order");
        self.advance(attempt, from, LoopState::Failed, Some(err.to_string()))
    }
}

fn writer_instruction(task: &str, feedback: Option<&str>, previous: Option<&str>) -> String {
    let mut instruction = format!("Write a Python script for this chart:\n\n{}\n", task);
    if let Some(previous) = previous {
        instruction.push_str(&format!("\nYour previous script:\n```python\n{}\n```\n", previous));
    }
    if let Some(feedback) = feedback {
        instruction.push_str(&format!("\nFix the following before resubmitting:\n{}\n", feedback));
    }
    instruction
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_json() {
        let v = parse_verdict(r#"{"approved": false, "feedback": "missing savefig"}"#);
        assert!(!v.approved);
        assert_eq!(v.feedback, "missing savefig");
    }

    #[test]
    fn test_parse_verdict_fenced() {
        let v = parse_verdict("Looks good.\n```json\n{\"approved\": true}\n```");
        assert!(v.approved);
        assert_eq!(v.feedback, "");
    }

    #[test]
    fn test_parse_verdict_prose_is_advisory_approval() {
        let v = parse_verdict("Consider adding axis labels.");
        assert!(v.approved);
        assert_eq!(v.feedback, "Consider adding axis labels.");
    }

    #[test]
    fn test_parse_verdict_wrong_shape_is_approval() {
        let v = parse_verdict(r#"{"approved": "maybe"}"#);
        assert!(v.approved);
    }

    #[test]
    fn test_writer_instruction_includes_feedback() {
        let text = writer_instruction("bar chart of yields", Some("NameError: plt"), Some("plot()"));
        assert!(text.contains("bar chart of yields"));
        assert!(text.contains("Your previous script:\n```python\nplot()\n```"));
        assert!(text.contains("NameError: plt"));
        assert!(!writer_instruction("t", None, None).contains("previous"));
    }

    #[test]
    fn test_out_of_order_message_is_refused_and_fails_loop() {
        let mut run = LoopRun::new("pH");
        let mut writer = Agent::new(AgentId(1), AgentRole::Writer, "writer-ph", "");
        let mut reviewer = Agent::new(AgentId(2), AgentRole::CodeReviewer, "code-reviewer-ph", "");

        let second = Message::text(AgentId(1), "writer-ph", AgentRole::Writer, 2, "v2");
        let first = Message::text(AgentId(1), "writer-ph", AgentRole::Writer, 1, "v1");
        run.record(second, &mut writer, &mut reviewer).unwrap();
        let err = run.record(first, &mut writer, &mut reviewer).unwrap_err();

        assert!(matches!(err, TranscriptError::OutOfOrder { round: 1, .. }));
        assert_eq!(run.transcript.len(), 1);
        assert_eq!(writer.history().len(), 1);
        assert_eq!(reviewer.history().len(), 1);

        run.enter(2, None, LoopState::Writing, None);
        let state = run.abort(2, LoopState::Writing, err);
        assert_eq!(state, LoopState::Failed);
        let last = run.transitions.last().unwrap();
        assert_eq!(last.to, LoopState::Failed);
        assert!(last.note.as_deref().unwrap().contains("transcript order"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("pH by Depth (cm)"), "ph-by-depth-cm");
    }
}
