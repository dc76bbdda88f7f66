//! Layered configuration for colloquy.
//!
//! Settings are read from `.colloquy/colloquy.toml`, then overridden by
//! environment variables, then by CLI flags. Every field has a default, so a
//! missing file is the same as an empty one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [model]
//! command = "claude"
//! args = ["--print"]
//! timeout_secs = 300
//!
//! [search]
//! backend = "scholar"            # or "arxiv" (no API key needed)
//! endpoint = "https://serpapi.com/search.json"
//! api_key_env = "SERPAPI_API_KEY"
//! arxiv_endpoint = "http://export.arxiv.org/api/query"
//! start = 0
//! max_results = 10
//! max_retries = 3
//!
//! [downloads]
//! enabled = true
//! concurrency = 5
//! max_retries = 3
//! timeout_secs = 30
//!
//! [dialogue]
//! perspectives = 3
//! rounds = 2
//! perspective_labels = ["methodological", "empirical"]
//!
//! [charts]
//! max_attempts = 3
//! execution_timeout_secs = 60
//! grace_secs = 5
//!
//! [sandbox]
//! interpreter = "python3"
//! image = "python:3.12-slim"
//! ```
//!
//! Environment overrides: `COLLOQUY_MODEL_CMD`, `COLLOQUY_ROUNDS`,
//! `COLLOQUY_PERSPECTIVES`, `COLLOQUY_MAX_ATTEMPTS`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::SandboxConfig;
use crate::capability::sandbox::SandboxSection;
use crate::pipeline::{ChartRequest, PipelineRequest};

pub const CONFIG_DIR: &str = ".colloquy";
pub const CONFIG_FILE: &str = "colloquy.toml";

/// Language model command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_command")]
    pub command: String,
    #[serde(default = "default_model_args")]
    pub args: Vec<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_command() -> String {
    "claude".to_string()
}

fn default_model_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_model_timeout() -> u64 {
    300
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            command: default_model_command(),
            args: default_model_args(),
            timeout_secs: default_model_timeout(),
        }
    }
}

/// Which literature search adapter a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    /// Google Scholar through SerpApi. Needs an API key.
    #[default]
    Scholar,
    /// The arXiv export API.
    Arxiv,
}

/// Literature search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSection {
    #[serde(default)]
    pub backend: SearchBackend,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_arxiv_endpoint")]
    pub arxiv_endpoint: String,
    /// Offset of the first arXiv result. Unsigned, so negative offsets are
    /// rejected when the file is parsed.
    #[serde(default)]
    pub start: u32,
}

fn default_arxiv_endpoint() -> String {
    crate::capability::arxiv::DEFAULT_ENDPOINT.to_string()
}

fn default_search_endpoint() -> String {
    "https://serpapi.com/search.json".to_string()
}

fn default_api_key_env() -> String {
    "SERPAPI_API_KEY".to_string()
}

fn default_max_results() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_search_timeout() -> u64 {
    30
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            backend: SearchBackend::default(),
            endpoint: default_search_endpoint(),
            api_key_env: default_api_key_env(),
            max_results: default_max_results(),
            max_retries: default_max_retries(),
            timeout_secs: default_search_timeout(),
            arxiv_endpoint: default_arxiv_endpoint(),
            start: 0,
        }
    }
}

/// Full-text downloads for cited papers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadsSection {
    #[serde(default = "default_downloads_enabled")]
    pub enabled: bool,
    #[serde(default = "default_download_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

fn default_downloads_enabled() -> bool {
    true
}

fn default_download_concurrency() -> usize {
    5
}

impl Default for DownloadsSection {
    fn default() -> Self {
        Self {
            enabled: default_downloads_enabled(),
            concurrency: default_download_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_search_timeout(),
        }
    }
}

/// Dialogue sessions (outline and polish).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueSection {
    #[serde(default = "default_perspectives")]
    pub perspectives: usize,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default)]
    pub perspective_labels: Vec<String>,
}

fn default_perspectives() -> usize {
    3
}

fn default_rounds() -> u32 {
    2
}

impl Default for DialogueSection {
    fn default() -> Self {
        Self {
            perspectives: default_perspectives(),
            rounds: default_rounds(),
            perspective_labels: Vec::new(),
        }
    }
}

/// Chart code loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartsSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_execution_timeout() -> u64 {
    60
}

fn default_grace() -> u64 {
    5
}

impl Default for ChartsSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            execution_timeout_secs: default_execution_timeout(),
            grace_secs: default_grace(),
        }
    }
}

/// Input file handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputsSection {
    /// Characters kept from each notes or data file.
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,
}

fn default_char_budget() -> usize {
    8_000
}

impl Default for InputsSection {
    fn default() -> Self {
        Self {
            char_budget: default_char_budget(),
        }
    }
}

/// Root of `.colloquy/colloquy.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColloquyToml {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub downloads: DownloadsSection,
    #[serde(default)]
    pub dialogue: DialogueSection,
    #[serde(default)]
    pub charts: ChartsSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub inputs: InputsSection,
}

impl ColloquyToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse colloquy.toml")
    }

    /// Load `colloquy.toml` from `colloquy_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(colloquy_dir: &Path) -> Result<Self> {
        let config_path = colloquy_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize colloquy.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`. Returns warnings for
    /// values that could not be parsed.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(cmd) = lookup("COLLOQUY_MODEL_CMD").filter(|c| !c.trim().is_empty()) {
            self.model.command = cmd;
        }
        if let Some(value) = lookup("COLLOQUY_ROUNDS") {
            match value.trim().parse() {
                Ok(rounds) => self.dialogue.rounds = rounds,
                Err(_) => warnings.push(format!("Ignoring COLLOQUY_ROUNDS='{}': not a number", value)),
            }
        }
        if let Some(value) = lookup("COLLOQUY_PERSPECTIVES") {
            match value.trim().parse() {
                Ok(count) => self.dialogue.perspectives = count,
                Err(_) => warnings.push(format!("Ignoring COLLOQUY_PERSPECTIVES='{}': not a number", value)),
            }
        }
        if let Some(value) = lookup("COLLOQUY_MAX_ATTEMPTS") {
            match value.trim().parse() {
                Ok(attempts) => self.charts.max_attempts = attempts,
                Err(_) => warnings.push(format!("Ignoring COLLOQUY_MAX_ATTEMPTS='{}': not a number", value)),
            }
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.model.command.trim().is_empty() {
            warnings.push("model.command is empty".to_string());
        }
        if self.model.timeout_secs == 0 {
            warnings.push("model.timeout_secs is 0: every model call will time out".to_string());
        }
        if !(1..=100).contains(&self.search.max_results) {
            warnings.push(format!(
                "search.max_results = {} is out of range (1-100)",
                self.search.max_results
            ));
        }
        if self.downloads.enabled && self.downloads.concurrency == 0 {
            warnings.push("downloads.concurrency is 0: downloads run one at a time".to_string());
        }
        if self.dialogue.perspectives == 0 {
            warnings.push("dialogue.perspectives is 0: sessions will have no reviewers".to_string());
        }
        if self.dialogue.perspective_labels.len() > self.dialogue.perspectives {
            warnings.push(format!(
                "dialogue.perspective_labels has {} entries but perspectives = {}; extra labels are ignored",
                self.dialogue.perspective_labels.len(),
                self.dialogue.perspectives
            ));
        }
        if self.charts.max_attempts == 0 {
            warnings.push("charts.max_attempts is 0: every chart will fail".to_string());
        }
        if self.charts.execution_timeout_secs == 0 {
            warnings.push("charts.execution_timeout_secs is 0".to_string());
        }
        if let Some(cpus) = self.sandbox.cpus
            && cpus <= 0.0
        {
            warnings.push(format!("sandbox.cpus = {} must be positive", cpus));
        }

        warnings
    }
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub model_cmd: Option<String>,
    pub perspectives: Option<usize>,
    pub rounds: Option<u32>,
    pub max_attempts: Option<u32>,
}

/// Fully resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct ColloquyConfig {
    pub project_dir: PathBuf,
    pub colloquy_dir: PathBuf,
    pub toml: ColloquyToml,
    pub verbose: bool,
    /// Problems found while layering (bad env values).
    pub env_warnings: Vec<String>,
}

impl ColloquyConfig {
    /// File layer only.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let colloquy_dir = project_dir.join(CONFIG_DIR);
        let toml = ColloquyToml::load_or_default(&colloquy_dir)?;

        Ok(Self {
            project_dir,
            colloquy_dir,
            toml,
            verbose: false,
            env_warnings: Vec::new(),
        })
    }

    /// File, then process environment, then CLI flags.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, overrides: CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.env_warnings = config.toml.apply_env_with(|key| std::env::var(key).ok());
        config.verbose = verbose;
        config.apply_overrides(overrides);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: CliOverrides) {
        if let Some(cmd) = overrides.model_cmd {
            self.toml.model.command = cmd;
        }
        if let Some(count) = overrides.perspectives {
            self.toml.dialogue.perspectives = count;
        }
        if let Some(rounds) = overrides.rounds {
            self.toml.dialogue.rounds = rounds;
        }
        if let Some(attempts) = overrides.max_attempts {
            self.toml.charts.max_attempts = attempts;
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.colloquy_dir.join(CONFIG_FILE)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.colloquy_dir.join("runs")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.colloquy_dir.join("logs")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.colloquy_dir.join("scratch")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.runs_dir()).context("Failed to create runs directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.scratch_dir()).context("Failed to create scratch directory")?;
        Ok(())
    }

    /// `[sandbox]` from colloquy.toml, overlaid by `.colloquy/sandbox.toml`.
    pub fn sandbox_config(&self) -> Result<SandboxConfig> {
        let mut config = SandboxConfig::default();
        config.apply(self.toml.sandbox.clone());
        if let Some(section) = SandboxConfig::load_section(&self.project_dir)? {
            config.apply(section);
        }
        Ok(config)
    }

    /// API key for literature search, if the configured variable is set.
    pub fn search_api_key(&self) -> Option<String> {
        std::env::var(&self.toml.search.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.model.timeout_secs)
    }

    /// Pipeline request for `topic` with every configured setting applied.
    pub fn pipeline_request(
        &self,
        topic: impl Into<String>,
        inputs: Vec<PathBuf>,
        charts: Vec<ChartRequest>,
    ) -> PipelineRequest {
        let mut request = PipelineRequest::new(topic)
            .with_inputs(inputs)
            .with_charts(charts)
            .with_perspectives(self.toml.dialogue.perspectives)
            .with_perspective_labels(self.toml.dialogue.perspective_labels.clone())
            .with_rounds(self.toml.dialogue.rounds)
            .with_max_attempts(self.toml.charts.max_attempts)
            .with_execution_timeout(
                Duration::from_secs(self.toml.charts.execution_timeout_secs),
                Duration::from_secs(self.toml.charts.grace_secs),
            );
        request.char_budget = self.toml.inputs.char_budget;
        request
    }

    /// File validation warnings plus environment warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        warnings.extend(self.env_warnings.iter().cloned());
        warnings
    }
}
