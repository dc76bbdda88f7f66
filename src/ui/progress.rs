//! Pipeline progress UI.
//!
//! Consumes [`PipelineEvent`]s from the pipeline's event channel and renders
//! them in one of three modes:
//! - `full`: stage header bar plus one bar per dialogue session and chart
//! - `minimal`: one line per notable event
//! - `json`: one JSON object per event, for machine consumption

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::code_loop::LoopState;
use crate::pipeline::{PipelineEvent, Stage};
use crate::ui::icons::{CHART, CHECK, CROSS, DIALOGUE, RETRY, SPARKLE, STAGE, STOP};

/// Output mode for the pipeline UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

/// Terminal renderer for one pipeline run.
///
/// Owned by a single task that drains the event channel, so bars are kept in
/// plain maps.
pub struct PipelineUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    session_bars: HashMap<String, ProgressBar>,
    chart_bars: HashMap<String, ProgressBar>,
    verbose: bool,
    term: Term,
}

impl PipelineUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = multi.add(ProgressBar::new(Stage::all().len() as u64));
        header_bar.set_style(bar_style(
            "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            "█▓▒░",
        ));
        header_bar.set_prefix("colloquy");
        header_bar.set_message("Starting...");
        if mode != UiMode::Full {
            header_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }

        Self {
            mode,
            multi,
            header_bar,
            session_bars: HashMap::new(),
            chart_bars: HashMap::new(),
            verbose,
            term: Term::stdout(),
        }
    }

    /// Render events until the pipeline drops its sender.
    pub async fn drain(mut self, mut rx: mpsc::Receiver<PipelineEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
        self.finish();
    }

    pub fn handle_event(&mut self, event: &PipelineEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &PipelineEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &PipelineEvent) {
        let line = match event {
            PipelineEvent::StageStarted { stage } => format!("Stage {}", stage),
            PipelineEvent::RoundCompleted {
                session,
                round,
                rounds_total,
                ..
            } => format!("{} round {}/{}", session, round + 1, rounds_total),
            PipelineEvent::AttemptFinished {
                chart,
                attempt,
                state,
                detail,
            } => match state {
                LoopState::Succeeded => format!("✓ {} (attempt {})", chart, attempt),
                LoopState::Failed => format!(
                    "✗ {} ({})",
                    chart,
                    detail.as_deref().unwrap_or("failed")
                ),
                _ => return,
            },
            PipelineEvent::StageCompleted { stage, duration_ms } => format!(
                "Done {} in {}",
                stage,
                format_duration(Duration::from_millis(*duration_ms))
            ),
            PipelineEvent::StageFailed { stage, error } => format!("✗ {}: {}", stage, error),
            PipelineEvent::Cancelled { stage } => format!("Cancelled during {}", stage),
            PipelineEvent::AttemptStarted { .. } => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage } => self.on_stage_started(*stage),
            PipelineEvent::RoundCompleted {
                session,
                round,
                rounds_total,
                failed_agents,
                references,
            } => self.on_round_completed(session, *round, *rounds_total, *failed_agents, *references),
            PipelineEvent::AttemptStarted {
                chart,
                attempt,
                max_attempts,
            } => self.on_attempt_started(chart, *attempt, *max_attempts),
            PipelineEvent::AttemptFinished {
                chart,
                attempt,
                state,
                detail,
            } => self.on_attempt_finished(chart, *attempt, *state, detail.as_deref()),
            PipelineEvent::StageCompleted { stage, duration_ms } => {
                self.on_stage_completed(*stage, Duration::from_millis(*duration_ms))
            }
            PipelineEvent::StageFailed { stage, error } => self.on_stage_failed(*stage, error),
            PipelineEvent::Cancelled { stage } => self.on_cancelled(*stage),
        }
    }

    fn on_stage_started(&self, stage: Stage) {
        self.multi.println("").ok();
        self.multi
            .println(format!(
                "{} {} {}",
                STAGE,
                style("═".repeat(40)).cyan(),
                style(stage).yellow().bold()
            ))
            .ok();
        self.header_bar.set_message(format!("{}", stage));
    }

    fn on_round_completed(
        &mut self,
        session: &str,
        round: u32,
        rounds_total: u32,
        failed_agents: usize,
        references: usize,
    ) {
        let bar = self.session_bars.entry(session.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(rounds_total as u64));
            bar.set_style(bar_style(
                "  {prefix:.bold} [{bar:30.green/white}] {pos}/{len} {msg}",
                "█▓░",
            ));
            bar.set_prefix(format!("{}{}", DIALOGUE, session));
            bar
        });
        bar.set_position(round as u64 + 1);
        bar.set_message(format!("{} refs", style(references).cyan()));

        if failed_agents > 0 {
            self.multi
                .println(format!(
                    "    {} {} reviewer(s) failed in {} round {}",
                    CROSS,
                    style(failed_agents).red(),
                    session,
                    round
                ))
                .ok();
        }

        if round + 1 >= rounds_total {
            bar.finish_with_message(format!("{} converged, {} refs", CHECK, references));
        }
    }

    fn on_attempt_started(&mut self, chart: &str, attempt: u32, max_attempts: u32) {
        let bar = self.chart_bars.entry(chart.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(max_attempts as u64));
            bar.set_style(bar_style(
                "  {prefix:.bold} [{bar:30.green/white}] {pos}/{len} {msg}",
                "█▓░",
            ));
            bar.set_prefix(format!("{}{}", CHART, chart));
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        bar.set_position(attempt as u64);
        bar.set_message(format!("attempt {}/{}", style(attempt).cyan(), max_attempts));
    }

    fn on_attempt_finished(&mut self, chart: &str, attempt: u32, state: LoopState, detail: Option<&str>) {
        match state {
            LoopState::Succeeded => {
                if let Some(bar) = self.chart_bars.remove(chart) {
                    bar.set_style(bar_style("  {prefix:.bold} [{bar:30.green/green}] {msg}", "███"));
                    bar.finish_with_message(format!("{} attempt {}", CHECK, attempt));
                }
            }
            LoopState::Failed => {
                if let Some(bar) = self.chart_bars.remove(chart) {
                    bar.set_style(bar_style("  {prefix:.bold} [{bar:30.red/red}] {msg}", "███"));
                    bar.finish_with_message(format!("{} {}", CROSS, detail.unwrap_or("failed")));
                }
            }
            _ => {
                if let Some(bar) = self.chart_bars.get(chart) {
                    bar.set_message(format!("{} retrying", RETRY));
                }
                if self.verbose
                    && let Some(detail) = detail
                {
                    self.multi
                        .println(format!(
                            "    {} {} attempt {}: {}",
                            RETRY,
                            style(chart).yellow(),
                            attempt,
                            style(detail).dim()
                        ))
                        .ok();
                }
            }
        }
    }

    fn on_stage_completed(&self, stage: Stage, duration: Duration) {
        self.header_bar.inc(1);
        self.multi
            .println(format!(
                "  {} {} {} ({})",
                SPARKLE,
                style(stage).green().bold(),
                style("complete").green(),
                format_duration(duration)
            ))
            .ok();
    }

    fn on_stage_failed(&self, stage: Stage, error: &str) {
        self.multi
            .println(format!(
                "  {} {} {}: {}",
                CROSS,
                style(stage).red().bold(),
                style("failed").red(),
                error
            ))
            .ok();
        self.header_bar.abandon_with_message(format!("failed in {}", stage));
    }

    fn on_cancelled(&self, stage: Stage) {
        self.multi
            .println(format!(
                "  {} {} during {}",
                STOP,
                style("cancelled").yellow().bold(),
                stage
            ))
            .ok();
        self.header_bar.abandon_with_message(format!("cancelled in {}", stage));
    }

    fn finish(self) {
        for bar in self.chart_bars.values().chain(self.session_bars.values()) {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        if !self.header_bar.is_finished() {
            self.header_bar.finish_with_message("done");
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
