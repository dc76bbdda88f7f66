//! Top-level sequencer.
//!
//! ```text
//! Outline (seed draft + dialogue session)
//!   -> Charts (one code loop per chart, all in parallel)
//!   -> Assembly (pure merge)
//!   -> Polish (dialogue session with frozen citations)
//! ```
//!
//! A fatal failure in any stage stops the pipeline and is reported as a
//! [`PipelineStageFailure`] carrying everything produced so far. Cancellation
//! lets in-flight rounds and attempts finish, starts nothing new, and returns
//! the best draft collected so far with [`PipelineStatus::Cancelled`].

pub mod assembly;
pub mod inputs;
pub mod seed;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capability::Capabilities;
use crate::code_loop::{CodeLoop, LoopOutcome, LoopSettings, LoopState};
use crate::dialogue::{ArbiterConfig, DialogueSession};
use crate::draft::{DraftArtifact, Figure, FigureArtifact};
use crate::errors::{PipelineStageFailure, StageError};
use crate::references::ReferenceSet;
use crate::transcript::Transcript;
use crate::util::truncate_chars;

pub use inputs::{InputBundle, InputKind};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Outline,
    Charts,
    Assembly,
    Polish,
}

impl Stage {
    pub fn all() -> [Stage; 4] {
        [Stage::Outline, Stage::Charts, Stage::Assembly, Stage::Polish]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Outline => "outline",
            Self::Charts => "charts",
            Self::Assembly => "assembly",
            Self::Polish => "polish",
        };
        write!(f, "{}", s)
    }
}

/// Progress events emitted while the pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    /// An arbiter round of a dialogue session finished.
    RoundCompleted {
        session: String,
        round: u32,
        rounds_total: u32,
        failed_agents: usize,
        references: usize,
    },
    AttemptStarted {
        chart: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// A code loop attempt ended. `state` is where the loop went next.
    AttemptFinished {
        chart: String,
        attempt: u32,
        state: LoopState,
        detail: Option<String>,
    },
    StageCompleted {
        stage: Stage,
        duration_ms: u64,
    },
    StageFailed {
        stage: Stage,
        error: String,
    },
    Cancelled {
        stage: Stage,
    },
}

pub(crate) async fn emit(tx: &Option<mpsc::Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = tx {
        tx.send(event).await.ok();
    }
}

/// A chart to produce: `title`, what to plot, and optionally a data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,
}

impl ChartRequest {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, path: impl Into<PathBuf>) -> Self {
        self.data = Some(path.into());
        self
    }

    /// Task text for the writer, with the data file's head inlined.
    pub fn task(&self, char_budget: usize) -> String {
        let mut task = format!("Chart title: {}\n\n{}\n", self.title, self.description);
        if let Some(path) = &self.data {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            match std::fs::read(path) {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    task.push_str(&format!(
                        "\nThe data is below (file `{}`). Embed what you need in the script; \
                         the file itself is not available when it runs.\n```\n{}\n```\n",
                        name,
                        truncate_chars(&text, char_budget).trim_end()
                    ));
                }
                Err(e) => {
                    tracing::warn!(chart = %self.title, path = %path.display(), error = %e, "chart data unreadable");
                    task.push_str(&format!("\n(The data file `{}` could not be read.)\n", name));
                }
            }
        }
        task
    }
}

impl FromStr for ChartRequest {
    type Err = String;

    /// `"Title: description"` with an optional trailing `@path/to/data.csv`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (title, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("expected 'Title: description[ @data-file]', got '{}'", s))?;
        let title = title.trim();
        if title.is_empty() {
            return Err("chart title is empty".to_string());
        }

        let rest = rest.trim();
        let (description, data) = match rest.rsplit_once(" @") {
            Some((desc, path)) if !path.trim().is_empty() => (desc.trim(), Some(PathBuf::from(path.trim()))),
            _ => match rest.strip_prefix('@') {
                Some(path) if !path.trim().is_empty() => ("", Some(PathBuf::from(path.trim()))),
                _ => (rest, None),
            },
        };

        Ok(Self {
            title: title.to_string(),
            description: if description.is_empty() {
                format!("Plot {}.", title)
            } else {
                description.to_string()
            },
            data,
        })
    }
}

/// Everything a pipeline run is asked to do.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub topic: String,
    pub inputs: Vec<PathBuf>,
    pub charts: Vec<ChartRequest>,
    /// Number of reviewer agents per dialogue session.
    pub perspectives: usize,
    /// Explicit perspective labels; generated ones are used when empty.
    pub perspective_labels: Vec<String>,
    pub rounds: u32,
    pub max_attempts: u32,
    pub execution_timeout: Duration,
    pub grace: Duration,
    /// Characters kept per input file when building shared context.
    pub char_budget: usize,
}

impl PipelineRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            inputs: Vec::new(),
            charts: Vec::new(),
            perspectives: 3,
            perspective_labels: Vec::new(),
            rounds: 2,
            max_attempts: 3,
            execution_timeout: Duration::from_secs(60),
            grace: Duration::from_secs(5),
            char_budget: 8_000,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_charts(mut self, charts: Vec<ChartRequest>) -> Self {
        self.charts = charts;
        self
    }

    pub fn with_perspectives(mut self, count: usize) -> Self {
        self.perspectives = count;
        self
    }

    pub fn with_perspective_labels(mut self, labels: Vec<String>) -> Self {
        self.perspective_labels = labels;
        self
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration, grace: Duration) -> Self {
        self.execution_timeout = timeout;
        self.grace = grace;
        self
    }

    /// Reject requests that cannot produce a coherent document: an empty
    /// topic, or two charts whose titles differ only in case. Figures are
    /// matched to sections by title, so such charts would collapse into one.
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic is empty".to_string());
        }
        let mut seen: HashSet<String> = HashSet::new();
        for chart in &self.charts {
            if !seen.insert(chart.title.trim().to_lowercase()) {
                return Err(format!("duplicate chart title '{}'", chart.title.trim()));
            }
        }
        Ok(())
    }

    fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_attempts: self.max_attempts,
            execution_timeout: self.execution_timeout,
            grace: self.grace,
        }
    }
}

/// How one chart's loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartReport {
    pub title: String,
    pub state: LoopState,
    pub attempts_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure: Option<Figure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Artifacts produced before a failure or cancellation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialArtifacts {
    pub seed: Option<DraftArtifact>,
    pub outline: Option<DraftArtifact>,
    pub charts: Vec<ChartReport>,
    pub assembled: Option<DraftArtifact>,
    pub transcripts: Vec<Transcript>,
    pub references: ReferenceSet,
    pub warnings: Vec<String>,
}

impl PartialArtifacts {
    /// Most advanced draft available.
    pub fn best_draft(&self) -> Option<&DraftArtifact> {
        self.assembled
            .as_ref()
            .or(self.outline.as_ref())
            .or(self.seed.as_ref())
    }

    pub fn successful_figures(&self) -> Vec<Figure> {
        self.charts.iter().filter_map(|c| c.figure.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Cancelled { stage: Stage },
}

/// A finished (or cancelled) pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub status: PipelineStatus,
    pub document: DraftArtifact,
    /// Outline, chart and polish transcripts in execution order.
    pub transcripts: Vec<Transcript>,
    pub references: ReferenceSet,
    pub charts: Vec<ChartReport>,
    pub warnings: Vec<String>,
}

impl PipelineOutput {
    pub fn is_complete(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    fn cancelled(stage: Stage, partial: PartialArtifacts, topic: &str) -> Self {
        let document = partial
            .best_draft()
            .cloned()
            .unwrap_or_else(|| DraftArtifact::seed(topic, Vec::new()));
        Self {
            status: PipelineStatus::Cancelled { stage },
            document,
            transcripts: partial.transcripts,
            references: partial.references,
            charts: partial.charts,
            warnings: partial.warnings,
        }
    }
}

pub struct Pipeline {
    caps: Capabilities,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
    figures_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            cancel: CancellationToken::new(),
            event_tx: None,
            figures_dir: None,
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

    /// Copy chart images here and reference them as `figures/<file>`.
    pub fn with_figures_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.figures_dir = Some(dir.into());
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutput, PipelineStageFailure> {
        let mut partial = PartialArtifacts::default();

        // Outline
        let started = self.start_stage(Stage::Outline).await;
        if let Err(reason) = request.validate() {
            return Err(self.fail(Stage::Outline, StageError::Input(reason), partial).await);
        }

        let bundle = InputBundle::load(&request.inputs, request.char_budget);
        partial.warnings.extend(bundle.warnings.iter().cloned());
        partial.references.add_papers(bundle.prior_references.iter().cloned());
        let context = bundle.context();

        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(Stage::Outline, partial, &request.topic).await);
        }

        let seed = match seed::draft_seed(
            self.caps.model.as_ref(),
            &request.topic,
            context.as_deref(),
            request.perspectives,
            &request.perspective_labels,
        )
        .await
        {
            Ok(seed) => seed,
            Err(err) => return Err(self.fail(Stage::Outline, err, partial).await),
        };
        partial.seed = Some(seed.draft.clone());
        let perspectives = seed.perspectives;

        let mut session = DialogueSession::new(
            "outline",
            &request.topic,
            &perspectives,
            ArbiterConfig::default(),
            request.rounds,
            self.caps.model.clone(),
            self.caps.search.clone(),
        )
        .with_references(partial.references.clone())
        .with_cancellation(self.cancel.clone());
        if let Some(context) = &context {
            session = session.with_context(context.clone());
        }
        if let Some(tx) = &self.event_tx {
            session = session.with_event_channel(tx.clone());
        }

        let outline = match session.run(&seed.draft).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                partial.transcripts.push(failure.transcript.clone());
                return Err(self.fail(Stage::Outline, failure, partial).await);
            }
        };
        partial.transcripts.push(outline.transcript);
        partial.references = outline.references;
        partial.outline = Some(outline.artifact.clone());
        if outline.cancelled {
            return Ok(self.cancelled(Stage::Outline, partial, &request.topic).await);
        }
        self.complete_stage(Stage::Outline, started).await;

        // Charts
        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(Stage::Charts, partial, &request.topic).await);
        }
        let started = self.start_stage(Stage::Charts).await;
        let outcomes = self.run_charts(request).await;

        let mut first_failure: Option<(String, LoopOutcome)> = None;
        let mut any_cancelled = false;
        for (index, (chart, outcome)) in request.charts.iter().zip(outcomes).enumerate() {
            let figure = if outcome.succeeded() {
                Some(self.figure_for(index, chart, &outcome))
            } else {
                None
            };
            if self.figures_dir.is_some() {
                self.caps.executor.cleanup(&outcome.result);
            }
            partial.charts.push(ChartReport {
                title: chart.title.clone(),
                state: outcome.state,
                attempts_used: outcome.attempts_used,
                figure,
                code: outcome.code.clone(),
                error: (!outcome.succeeded()).then(|| outcome.result.feedback()),
                cancelled: outcome.cancelled,
            });
            partial.transcripts.push(outcome.transcript.clone());

            if outcome.cancelled {
                any_cancelled = true;
            } else if !outcome.succeeded() && first_failure.is_none() {
                first_failure = Some((chart.title.clone(), outcome));
            }
        }

        if let Some((title, outcome)) = first_failure {
            let err = StageError::ChartFailed {
                title,
                attempts: outcome.attempts_used,
                detail: outcome.result.feedback(),
            };
            return Err(self.fail(Stage::Charts, err, partial).await);
        }
        if any_cancelled {
            // Best partial: outline plus whatever charts finished.
            partial.assembled = Some(assembly::assemble(
                partial.outline.as_ref().unwrap_or(&seed.draft),
                &partial.successful_figures(),
            ));
            return Ok(self.cancelled(Stage::Charts, partial, &request.topic).await);
        }
        self.complete_stage(Stage::Charts, started).await;

        // Assembly
        let started = self.start_stage(Stage::Assembly).await;
        let assembled = assembly::assemble(&outline.artifact, &partial.successful_figures());
        partial.assembled = Some(assembled.clone());
        self.complete_stage(Stage::Assembly, started).await;

        // Polish
        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(Stage::Polish, partial, &request.topic).await);
        }
        let started = self.start_stage(Stage::Polish).await;
        let mut session = DialogueSession::new(
            "polish",
            &request.topic,
            &perspectives,
            ArbiterConfig::frozen(),
            request.rounds,
            self.caps.model.clone(),
            self.caps.search.clone(),
        )
        .with_references(partial.references.clone())
        .with_cancellation(self.cancel.clone());
        if let Some(tx) = &self.event_tx {
            session = session.with_event_channel(tx.clone());
        }

        let polish = match session.run(&assembled).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                partial.transcripts.push(failure.transcript.clone());
                return Err(self.fail(Stage::Polish, failure, partial).await);
            }
        };
        partial.transcripts.push(polish.transcript);
        if polish.cancelled {
            partial.assembled = Some(polish.artifact);
            return Ok(self.cancelled(Stage::Polish, partial, &request.topic).await);
        }
        self.complete_stage(Stage::Polish, started).await;

        tracing::info!(
            version = polish.artifact.version,
            sections = polish.artifact.sections.len(),
            figures = polish.artifact.figures.len(),
            references = partial.references.paper_count(),
            "pipeline completed"
        );

        Ok(PipelineOutput {
            status: PipelineStatus::Completed,
            document: polish.artifact,
            transcripts: partial.transcripts,
            references: partial.references,
            charts: partial.charts,
            warnings: partial.warnings,
        })
    }

    async fn run_charts(&self, request: &PipelineRequest) -> Vec<LoopOutcome> {
        let settings = request.loop_settings();
        let loops: Vec<CodeLoop> = request
            .charts
            .iter()
            .map(|chart| {
                let mut code_loop = CodeLoop::new(
                    &chart.title,
                    Arc::clone(&self.caps.model),
                    Arc::clone(&self.caps.executor),
                    settings,
                )
                .with_cancellation(self.cancel.clone());
                if let Some(tx) = &self.event_tx {
                    code_loop = code_loop.with_event_channel(tx.clone());
                }
                code_loop
            })
            .collect();
        let tasks: Vec<String> = request
            .charts
            .iter()
            .map(|chart| chart.task(request.char_budget))
            .collect();

        join_all(loops.iter().zip(tasks.iter()).map(|(l, task)| l.run(task))).await
    }

    fn figure_for(&self, index: usize, chart: &ChartRequest, outcome: &LoopOutcome) -> Figure {
        let artifact = match &outcome.result.artifact {
            Some(path) => FigureArtifact::Image(self.publish_image(index, chart, path)),
            None => FigureArtifact::Text(outcome.result.output.clone()),
        };
        Figure {
            title: chart.title.clone(),
            caption: chart.description.clone(),
            artifact,
        }
    }

    /// Copy a sandbox image into the figures directory. Falls back to the
    /// scratch path when there is no figures directory or the copy fails.
    fn publish_image(&self, index: usize, chart: &ChartRequest, path: &Path) -> PathBuf {
        let Some(dir) = &self.figures_dir else {
            return path.to_path_buf();
        };
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
        let file_name = figure_file_name(index, &chart.title, ext);
        let target = dir.join(&file_name);
        let copied = std::fs::create_dir_all(dir).and_then(|_| std::fs::copy(path, &target));
        match copied {
            Ok(_) => PathBuf::from("figures").join(file_name),
            Err(e) => {
                tracing::warn!(chart = %chart.title, error = %e, "failed to copy chart image");
                path.to_path_buf()
            }
        }
    }

    async fn start_stage(&self, stage: Stage) -> Instant {
        tracing::info!(%stage, "stage started");
        emit(&self.event_tx, PipelineEvent::StageStarted { stage }).await;
        Instant::now()
    }

    async fn complete_stage(&self, stage: Stage, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(%stage, duration_ms, "stage completed");
        emit(&self.event_tx, PipelineEvent::StageCompleted { stage, duration_ms }).await;
    }

    async fn fail(&self, stage: Stage, err: impl Into<StageError>, partial: PartialArtifacts) -> PipelineStageFailure {
        let failure = PipelineStageFailure::new(stage, err, partial);
        tracing::error!(%stage, error = %failure.source, "stage failed");
        emit(
            &self.event_tx,
            PipelineEvent::StageFailed {
                stage,
                error: failure.source.to_string(),
            },
        )
        .await;
        failure
    }

    async fn cancelled(&self, stage: Stage, partial: PartialArtifacts, topic: &str) -> PipelineOutput {
        tracing::warn!(%stage, "pipeline cancelled");
        emit(&self.event_tx, PipelineEvent::Cancelled { stage }).await;
        PipelineOutput::cancelled(stage, partial, topic)
    }
}

/// `NN_<stem>.<ext>`, numbered by chart position so titles that slugify
/// alike still get their own file.
fn figure_file_name(index: usize, title: &str, ext: &str) -> String {
    format!("{:02}_{}.{}", index + 1, file_stem(title), ext)
}

fn file_stem(title: &str) -> String {
    let stem = title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if stem.is_empty() { "chart".to_string() } else { stem }
}
