//! Language model backed by a command-line client.
//!
//! The prompt is written to the child's stdin and the reply read from stdout,
//! the way `claude --print` is driven. Any CLI with the same contract works.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{LanguageModel, ModelRequest, ModelResponse};
use crate::errors::CapabilityError;

#[derive(Debug, Clone)]
pub struct CliModel {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CliModel {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, prompt: &str) -> Result<String, CapabilityError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapabilityError::ModelUnavailable(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CapabilityError::ModelUnavailable(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| CapabilityError::ModelUnavailable(format!("failed to close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CapabilityError::ModelUnavailable(format!("failed to wait for process: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapabilityError::ModelUnavailable(format!(
                "'{}' exited with code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(CapabilityError::ModelUnavailable(format!(
                "'{}' returned an empty response",
                self.command
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for CliModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, CapabilityError> {
        let prompt = request.render_prompt();
        let start = Instant::now();
        tracing::debug!(agent = %request.agent, chars = prompt.len(), "model call");

        // Dropping the timed-out future drops the child, which kills it.
        let text = tokio::time::timeout(self.timeout, self.run(&prompt))
            .await
            .map_err(|_| CapabilityError::ModelTimeout(self.timeout))??;

        tracing::debug!(
            agent = %request.agent,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model call finished"
        );
        Ok(ModelResponse::new(text))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::AgentRole;

    fn request(instruction: &str) -> ModelRequest {
        ModelRequest {
            agent: "test".into(),
            role: AgentRole::Writer,
            system: "system".into(),
            history: vec![],
            instruction: instruction.into(),
        }
    }

    #[tokio::test]
    async fn test_cli_model_echoes_prompt_via_cat() {
        let model = CliModel::new("cat", vec![], Duration::from_secs(5));
        let response = model.generate(&request("say hi")).await.unwrap();
        assert!(response.text.contains("say hi"));
    }

    #[tokio::test]
    async fn test_cli_model_missing_binary_is_unavailable() {
        let model = CliModel::new("colloquy-no-such-binary", vec![], Duration::from_secs(5));
        let err = model.generate(&request("x")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cli_model_times_out() {
        let model = CliModel::new("sleep", vec!["5".into()], Duration::from_millis(100));
        let err = model.generate(&request("x")).await.unwrap_err();
        assert_eq!(err, CapabilityError::ModelTimeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_cli_model_nonzero_exit() {
        let model = CliModel::new("false", vec![], Duration::from_secs(5));
        let err = model.generate(&request("x")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::ModelUnavailable(_)));
    }
}
