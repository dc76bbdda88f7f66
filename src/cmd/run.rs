//! Full pipeline run: `colloquy run <topic>`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use colloquy::audit::{PdfDownloader, RunArchive, RunConfig, RunReport};
use colloquy::capability::{
    ArxivSearch, Capabilities, CliModel, DisabledSearch, LiteratureSearch, ProcessSandbox, ScholarSearch,
};
use colloquy::config::{CliOverrides, ColloquyConfig, SearchBackend};
use colloquy::references::ReferenceSet;
use colloquy::pipeline::assembly::image_count;
use colloquy::pipeline::inputs::expand_patterns;
use colloquy::pipeline::{ChartRequest, Pipeline, PipelineEvent, PipelineOutput, PipelineStatus};
use colloquy::ui::icons::{BOOK, CHART, CHECK, CROSS, FOLDER, STOP, WARN};
use colloquy::ui::{PipelineUI, UiMode};

use super::super::RunArgs;

fn build_search(config: &ColloquyConfig, disabled: bool) -> Result<Arc<dyn LiteratureSearch>> {
    if disabled {
        return Ok(Arc::new(DisabledSearch));
    }
    let search = &config.toml.search;
    let timeout = std::time::Duration::from_secs(search.timeout_secs);

    match search.backend {
        SearchBackend::Arxiv => {
            let arxiv = ArxivSearch::new(
                search.arxiv_endpoint.clone(),
                search.max_results,
                search.max_retries,
                timeout,
            )?
            .with_start(search.start);
            Ok(Arc::new(arxiv))
        }
        SearchBackend::Scholar => {
            let Some(api_key) = config.search_api_key() else {
                tracing::warn!(
                    env = %search.api_key_env,
                    "no search API key set; literature search disabled"
                );
                return Ok(Arc::new(DisabledSearch));
            };
            let scholar = ScholarSearch::new(
                search.endpoint.clone(),
                api_key,
                search.max_results,
                search.max_retries,
                timeout,
            )?;
            Ok(Arc::new(scholar))
        }
    }
}

/// Fetch cited PDFs into the run archive. Problems are logged, never fatal.
async fn download_cited(archive: &mut RunArchive, config: &ColloquyConfig, references: &ReferenceSet) {
    let settings = &config.toml.downloads;
    let downloader = match PdfDownloader::new(
        std::time::Duration::from_secs(settings.timeout_secs),
        settings.concurrency,
        settings.max_retries,
    ) {
        Ok(downloader) => downloader,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build download client; skipping PDFs");
            return;
        }
    };
    match archive.download_papers(&downloader, references).await {
        Ok(saved) => tracing::debug!(saved, "cited papers downloaded"),
        Err(e) => tracing::warn!(error = %e, "failed to record downloads"),
    }
}

fn parse_charts(args: &[String]) -> Result<Vec<ChartRequest>> {
    args.iter()
        .map(|arg| {
            arg.parse::<ChartRequest>()
                .map_err(|e| anyhow::anyhow!("Invalid --chart '{}': {}", arg, e))
        })
        .collect()
}

pub async fn cmd_run(project_dir: &Path, verbose: bool, args: RunArgs) -> Result<()> {
    let mut config = ColloquyConfig::with_cli_args(
        project_dir.to_path_buf(),
        verbose,
        CliOverrides {
            model_cmd: args.model_cmd.clone(),
            perspectives: args.perspectives,
            rounds: args.rounds,
            max_attempts: args.max_attempts,
        },
    )?;
    if !args.perspective.is_empty() {
        config.toml.dialogue.perspective_labels = args.perspective.clone();
    }
    config.ensure_directories()?;

    for warning in config.validate() {
        eprintln!("{} {}", WARN, style(warning).yellow());
    }

    let charts = parse_charts(&args.charts)?;
    let (inputs, input_warnings) = expand_patterns(&args.inputs);
    for warning in &input_warnings {
        eprintln!("{} {}", WARN, style(warning).yellow());
    }

    let model = CliModel::new(
        config.toml.model.command.clone(),
        config.toml.model.args.clone(),
        config.model_timeout(),
    );
    let executor = ProcessSandbox::new(config.sandbox_config()?, config.scratch_dir());
    let caps = Capabilities::new(
        Arc::new(model),
        build_search(&config, args.no_search)?,
        Arc::new(executor),
    );

    let request = config.pipeline_request(args.topic.clone(), inputs.clone(), charts.clone());
    request
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid run request: {}", reason))?;

    let mut archive = RunArchive::start(
        &config.runs_dir(),
        RunConfig {
            topic: args.topic.clone(),
            project_dir: config.project_dir.clone(),
            model_command: config.toml.model.command.clone(),
            perspectives: request.perspectives,
            rounds: request.rounds,
            max_attempts: request.max_attempts,
            inputs,
            charts: charts.iter().map(|c| c.title.clone()).collect(),
        },
    )?;
    archive.add_warnings(input_warnings);

    let ui_mode = UiMode::parse(&args.ui);
    if ui_mode == UiMode::Full {
        println!();
        println!("{}", style("Colloquy").bold().cyan());
        println!("────────");
        println!("Topic: {}", args.topic);
        println!(
            "Reviewers: {} | Rounds: {} | Charts: {}",
            request.perspectives,
            request.rounds,
            request.charts.len()
        );
        println!();
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight work");
            signal_token.cancel();
        }
    });

    let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>(100);
    let ui = PipelineUI::new(ui_mode, verbose);
    let display_handle = tokio::spawn(ui.drain(event_rx));

    let pipeline = Pipeline::new(caps)
        .with_cancellation(cancel)
        .with_event_channel(event_tx)
        .with_figures_dir(archive.figures_dir());
    let result = pipeline.run(&request).await;
    drop(pipeline);
    display_handle.await.context("Progress display task failed")?;

    let downloads = config.toml.downloads.enabled && !args.no_downloads;
    match result {
        Ok(output) => {
            if downloads {
                download_cited(&mut archive, &config, &output.references).await;
            }
            let run_dir = archive.record_output(&output)?;
            if ui_mode != UiMode::Json {
                print_summary(&output, archive.report(), &run_dir);
            }
            Ok(())
        }
        Err(failure) => {
            if downloads {
                download_cited(&mut archive, &config, &failure.partial.references).await;
            }
            let run_dir = archive.record_failure(&failure)?;
            eprintln!();
            eprintln!(
                "{} {} stage failed: {}",
                CROSS,
                style(failure.stage).red().bold(),
                failure.source
            );
            eprintln!("{} Partial artifacts saved to {}", FOLDER, run_dir.display());
            anyhow::bail!("Pipeline failed in {} stage", failure.stage)
        }
    }
}

fn print_summary(output: &PipelineOutput, report: &RunReport, run_dir: &Path) {
    println!();
    match &output.status {
        PipelineStatus::Completed => {
            println!("{} {}", CHECK, style("Document complete").green().bold());
        }
        PipelineStatus::Cancelled { stage } => {
            println!(
                "{} {} during {} stage; best draft saved",
                STOP,
                style("Cancelled").yellow().bold(),
                stage
            );
        }
    }

    println!(
        "  Sections: {} | {} Figures: {} ({} images) from {} charts",
        output.document.sections.len(),
        CHART,
        output.document.figures.len(),
        image_count(&output.document),
        output.charts.len()
    );
    println!(
        "  {} References: {} papers for {} questions",
        BOOK,
        output.references.paper_count(),
        output.references.len()
    );
    if !report.downloads.is_empty() {
        let saved = report.downloads.iter().filter(|d| d.status.is_downloaded()).count();
        println!(
            "  {} PDFs: {} of {} saved to papers/",
            BOOK,
            saved,
            report.downloads.len()
        );
    }
    if !output.warnings.is_empty() {
        println!("  {} {} warning(s), see report.json", WARN, output.warnings.len());
    }
    println!("  {} {}", FOLDER, run_dir.display());
    println!();
}
