//! Sandboxed code execution for chart generation.
//!
//! Each run gets a fresh scratch directory that holds the script and anything
//! it writes. Without an image the interpreter runs as a local process with
//! the scratch directory as cwd and a cleared environment. With an image the
//! run happens in `docker run --network none` with only the scratch directory
//! mounted.
//!
//! Scratch directories are removed when a run fails, times out or produces
//! no image. A run that produced an image keeps its directory until
//! [`SandboxedExecutor::cleanup`] is called with the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use walkdir::WalkDir;

use super::{ExecutionResult, SandboxedExecutor};
use crate::errors::ExecutionFailure;
use crate::util::truncate_chars;

/// File extensions treated as chart output.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["png", "svg", "pdf", "jpg", "jpeg"];

const MAX_STDERR_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub image: Option<String>,
    pub memory: String,
    pub cpus: f64,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            image: None,
            memory: "2g".to_string(),
            cpus: 1.0,
            env: HashMap::new(),
        }
    }
}

/// Raw TOML structure for `.colloquy/sandbox.toml`
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SandboxToml {
    pub(crate) sandbox: Option<SandboxSection>,
}

#[derive(Debug, Default, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct SandboxSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl SandboxConfig {
    /// Load sandbox config from `.colloquy/sandbox.toml` in the project directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if let Some(section) = Self::load_section(project_path)? {
            config.apply(section);
        }
        Ok(config)
    }

    /// The raw `[sandbox]` table of `.colloquy/sandbox.toml`, if present.
    pub fn load_section(project_path: &Path) -> Result<Option<SandboxSection>> {
        let config_path = project_path.join(".colloquy").join("sandbox.toml");
        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let toml: SandboxToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(toml.sandbox)
    }

    /// Overlay the fields present in `section`.
    pub fn apply(&mut self, section: SandboxSection) {
        if let Some(interpreter) = section.interpreter {
            self.interpreter = interpreter;
        }
        if let Some(image) = section.image {
            self.image = Some(image);
        }
        if let Some(memory) = section.memory {
            self.memory = memory;
        }
        if let Some(cpus) = section.cpus {
            self.cpus = cpus;
        }
        if let Some(env) = section.env {
            self.env.extend(env);
        }
    }

    fn script_name(&self) -> &'static str {
        if self.interpreter.contains("python") {
            "main.py"
        } else {
            "main.script"
        }
    }
}

/// First chart-like file under `dir`, in file-name order.
pub fn find_artifact(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
}

/// Runs code through a local interpreter or a docker container.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    scratch_root: PathBuf,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            scratch_root: scratch_root.into(),
        }
    }

    fn prepare_scratch(&self, code: &str) -> std::io::Result<PathBuf> {
        let dir = self.scratch_root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)?;
        if let Err(e) = std::fs::write(dir.join(self.config.script_name()), code) {
            remove_scratch(&dir);
            return Err(e);
        }
        Ok(dir)
    }

    /// The per-run directory under the scratch root that holds `path`.
    fn scratch_dir_of(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.scratch_root).ok()?;
        let run_dir = relative.components().next()?;
        Some(self.scratch_root.join(run_dir))
    }

    fn command(&self, scratch: &Path, container: &str) -> Command {
        let script = self.config.script_name();
        match &self.config.image {
            Some(image) => {
                let mut cmd = Command::new("docker");
                let cpus = self.config.cpus.to_string();
                cmd.args(["run", "--rm", "--network", "none", "--name", container])
                    .args(["--memory", self.config.memory.as_str()])
                    .args(["--cpus", cpus.as_str()])
                    .arg("-v")
                    .arg(format!("{}:/work", scratch.display()))
                    .args(["-w", "/work"]);
                for (key, value) in &self.config.env {
                    cmd.arg("-e").arg(format!("{}={}", key, value));
                }
                cmd.arg(image).arg(&self.config.interpreter).arg(script);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.config.interpreter);
                cmd.arg(script)
                    .current_dir(scratch)
                    .env_clear()
                    .env("PATH", std::env::var("PATH").unwrap_or_default())
                    .env("HOME", scratch)
                    .env("TMPDIR", scratch)
                    .env("MPLBACKEND", "Agg")
                    .envs(&self.config.env);
                #[cfg(unix)]
                cmd.process_group(0);
                cmd
            }
        }
    }

    /// Kill everything the interpreter started. The child leads its own
    /// process group, so grandchildren go down with it.
    #[cfg(unix)]
    fn kill_process_group(&self, pid: Option<u32>) {
        if self.config.image.is_some() {
            return;
        }
        let Some(pid) = pid else {
            return;
        };
        // SAFETY: killpg only sends a signal; the group id is the pid of a
        // child spawned with process_group(0).
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "process group already gone");
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&self, _pid: Option<u32>) {}

    async fn kill_container(&self, container: &str) {
        if self.config.image.is_none() {
            return;
        }
        let result = Command::new("docker")
            .args(["kill", container])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(container, error = %e, "failed to kill timed-out container");
        }
    }
}

#[async_trait]
impl SandboxedExecutor for ProcessSandbox {
    async fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult {
        let start = Instant::now();
        let scratch = match self.prepare_scratch(code) {
            Ok(dir) => dir,
            Err(e) => {
                return ExecutionResult::failure(ExecutionFailure::Io(e.to_string()), "", elapsed_ms(start));
            }
        };

        let result = self.run_in(&scratch, timeout, start).await;
        if !result.success || result.artifact.is_none() {
            remove_scratch(&scratch);
        }
        result
    }

    fn cleanup(&self, result: &ExecutionResult) {
        if let Some(dir) = result.artifact.as_deref().and_then(|a| self.scratch_dir_of(a)) {
            remove_scratch(&dir);
        }
    }
}

impl ProcessSandbox {
    async fn run_in(&self, scratch: &Path, timeout: Duration, start: Instant) -> ExecutionResult {
        let container = format!("colloquy-{}", uuid::Uuid::new_v4().simple());

        let mut cmd = self.command(scratch, &container);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(scratch = %scratch.display(), "sandbox run");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(ExecutionFailure::Spawn(e.to_string()), "", elapsed_ms(start));
            }
        };
        let pid = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutionResult::failure(ExecutionFailure::Io(e.to_string()), "", elapsed_ms(start));
            }
            Err(_) => {
                self.kill_process_group(pid);
                self.kill_container(&container).await;
                tracing::warn!(?timeout, "sandbox run timed out");
                return ExecutionResult::timeout(elapsed_ms(start));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ExecutionResult::failure(
                ExecutionFailure::NonZeroExit {
                    code: output.status.code().unwrap_or(-1),
                    stderr: truncate_chars(stderr.trim(), MAX_STDERR_CHARS).to_string(),
                },
                stdout,
                elapsed_ms(start),
            );
        }

        ExecutionResult::success(stdout, find_artifact(scratch), elapsed_ms(start))
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn remove_scratch(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        tracing::debug!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.interpreter, "python3");
        assert!(config.image.is_none());
        assert_eq!(config.memory, "2g");
        assert_eq!(config.cpus, 1.0);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_sandbox_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config, SandboxConfig::default());
    }

    #[test]
    fn test_sandbox_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let colloquy_dir = dir.path().join(".colloquy");
        fs::create_dir_all(&colloquy_dir).unwrap();
        fs::write(
            colloquy_dir.join("sandbox.toml"),
            r#"
[sandbox]
image = "python:3.12-slim"
cpus = 2.5

[sandbox.env]
MPLBACKEND = "svg"
"#,
        )
        .unwrap();

        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(config.cpus, 2.5);
        assert_eq!(config.memory, "2g");
        assert_eq!(config.env.get("MPLBACKEND").unwrap(), "svg");
    }

    #[test]
    fn test_sandbox_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let colloquy_dir = dir.path().join(".colloquy");
        fs::create_dir_all(&colloquy_dir).unwrap();
        fs::write(colloquy_dir.join("sandbox.toml"), "not valid toml {{{{").unwrap();
        assert!(SandboxConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_find_artifact_picks_first_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out").join("b.PNG"), "").unwrap();
        fs::write(dir.path().join("a.svg"), "").unwrap();
        assert_eq!(find_artifact(dir.path()), Some(dir.path().join("a.svg")));
    }

    #[test]
    fn test_find_artifact_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(find_artifact(dir.path()), None);
    }

    #[cfg(unix)]
    fn shell_sandbox(root: &Path) -> ProcessSandbox {
        let config = SandboxConfig {
            interpreter: "sh".to_string(),
            ..SandboxConfig::default()
        };
        ProcessSandbox::new(config, root)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_success_captures_stdout_and_artifact() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = shell_sandbox(root.path());
        let result = sandbox
            .execute("echo plotted\ntouch chart.png\n", Duration::from_secs(10))
            .await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output.trim(), "plotted");
        let artifact = result.artifact.unwrap();
        assert!(artifact.starts_with(root.path()));
        assert!(artifact.ends_with("chart.png"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = shell_sandbox(root.path());
        let result = sandbox
            .execute("echo bad >&2\nexit 3\n", Duration::from_secs(10))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(ExecutionFailure::NonZeroExit {
                code: 3,
                stderr: "bad".to_string()
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_timeout_returns_promptly() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = shell_sandbox(root.path());
        let start = Instant::now();
        let result = sandbox.execute("sleep 10\n", Duration::from_millis(200)).await;
        assert!(result.is_timeout());
        assert!(!result.success);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    fn scratch_entries(root: &Path) -> usize {
        fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_and_timed_out_runs_leave_no_scratch() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = shell_sandbox(root.path());

        let failed = sandbox.execute("touch chart.png\nexit 1\n", Duration::from_secs(10)).await;
        assert!(!failed.success);
        assert_eq!(scratch_entries(root.path()), 0);

        let timed_out = sandbox.execute("sleep 10\n", Duration::from_millis(200)).await;
        assert!(timed_out.is_timeout());
        assert_eq!(scratch_entries(root.path()), 0);

        let text_only = sandbox.execute("echo ok\n", Duration::from_secs(10)).await;
        assert!(text_only.success);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_image_scratch_kept_until_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = shell_sandbox(root.path());
        let result = sandbox.execute("mkdir out\ntouch out/chart.png\n", Duration::from_secs(10)).await;
        let artifact = result.artifact.clone().unwrap();
        assert!(artifact.exists());
        assert_eq!(scratch_entries(root.path()), 1);

        sandbox.cleanup(&result);
        assert!(!artifact.exists());
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[test]
    fn test_cleanup_ignores_paths_outside_scratch_root() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let image = elsewhere.path().join("chart.png");
        fs::write(&image, "").unwrap();
        let sandbox = ProcessSandbox::new(SandboxConfig::default(), root.path());
        sandbox.cleanup(&ExecutionResult::success("", Some(image.clone()), 1));
        assert!(image.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let root = tempfile::tempdir().unwrap();
        let marks = tempfile::tempdir().unwrap();
        let marker = marks.path().join("late");
        let sandbox = shell_sandbox(root.path());
        let script = format!("(sleep 1; echo late > {}) &\nsleep 10\n", marker.display());

        let result = sandbox.execute(&script, Duration::from_millis(200)).await;
        assert!(result.is_timeout());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_missing_interpreter_is_spawn_failure() {
        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            interpreter: "colloquy-no-such-interpreter".to_string(),
            ..SandboxConfig::default()
        };
        let sandbox = ProcessSandbox::new(config, root.path());
        let result = sandbox.execute("x", Duration::from_secs(5)).await;
        assert!(matches!(result.error, Some(ExecutionFailure::Spawn(_))));
    }
}
