//! Archived run listing: `colloquy runs`.

use anyhow::Result;
use std::path::Path;

use colloquy::audit::RunOutcome;
use colloquy::audit::logger::{DOCUMENT_FILE, list_runs, load_report};
use colloquy::config::CONFIG_DIR;

pub fn cmd_runs(project_dir: &Path, limit: usize) -> Result<()> {
    let runs_dir = project_dir.join(CONFIG_DIR).join("runs");
    let runs = list_runs(&runs_dir)?;

    if runs.is_empty() {
        println!();
        println!("No runs found. Run 'colloquy run <topic>' to start one.");
        println!();
        return Ok(());
    }

    println!();
    println!("{:<32} {:<12} {:<10} Topic", "Run", "Status", "Duration");
    println!(
        "{:<32} {:<12} {:<10} -----",
        "--------------------------------", "------------", "----------"
    );

    for run_dir in runs.iter().take(limit) {
        let name = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let report = match load_report(run_dir) {
            Ok(report) => report,
            Err(e) => {
                println!("{:<32} {}", name, console::style(format!("unreadable: {}", e)).red());
                continue;
            }
        };

        let status = match &report.outcome {
            RunOutcome::InProgress => console::style("in-progress".to_string()).yellow(),
            RunOutcome::Completed => console::style("completed".to_string()).green(),
            RunOutcome::Cancelled { stage } => console::style(format!("cancelled@{}", stage)).yellow(),
            RunOutcome::Failed { stage, .. } => console::style(format!("failed@{}", stage)).red(),
        };
        let duration = report
            .duration_secs()
            .map(|s| format!("{:.1}s", s))
            .unwrap_or_else(|| "-".to_string());
        let marker = if run_dir.join(DOCUMENT_FILE).exists() { "" } else { " (no document)" };
        println!(
            "{:<32} {:<12} {:<10} {}{}",
            name, status, duration, report.config.topic, marker
        );
    }
    println!();

    if runs.len() > limit {
        println!("{} more run(s) not shown", runs.len() - limit);
        println!();
    }
    Ok(())
}
