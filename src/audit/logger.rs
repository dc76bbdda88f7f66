use super::download::{PAPERS_DIR, PdfDownloader};
use super::{ChartAudit, RunConfig, RunOutcome, RunReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::draft::DraftArtifact;
use crate::errors::PipelineStageFailure;
use crate::pipeline::{PipelineOutput, PipelineStatus, Stage};
use crate::references::ReferenceSet;
use crate::transcript::Transcript;

pub const REPORT_FILE: &str = "report.json";
pub const DOCUMENT_FILE: &str = "document.md";
pub const TRANSCRIPTS_FILE: &str = "transcripts.json";
pub const REFERENCES_FILE: &str = "references.json";
pub const FIGURES_DIR: &str = "figures";

/// Directory for one pipeline run. `report.json` is rewritten as the run
/// progresses so an interrupted run still leaves a readable record.
pub struct RunArchive {
    run_dir: PathBuf,
    report: RunReport,
}

impl RunArchive {
    /// Create `<runs_dir>/<timestamp>_<id8>/` with an in-progress report.
    pub fn start(runs_dir: &Path, config: RunConfig) -> Result<Self> {
        let report = RunReport::new(config);
        let dirname = format!(
            "{}_{}",
            report.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &report.run_id.to_string()[..8]
        );
        let run_dir = runs_dir.join(dirname);
        fs::create_dir_all(run_dir.join(FIGURES_DIR))
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

        let archive = Self { run_dir, report };
        archive.save_report()?;
        Ok(archive)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn figures_dir(&self) -> PathBuf {
        self.run_dir.join(FIGURES_DIR)
    }

    pub fn papers_dir(&self) -> PathBuf {
        self.run_dir.join(PAPERS_DIR)
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Warnings raised before the pipeline started, such as unmatched globs.
    pub fn add_warnings(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.report.warnings.extend(warnings);
    }

    /// Fetch the full text of every referenced paper with a PDF link into
    /// `papers/`. Returns how many were saved.
    pub async fn download_papers(&mut self, downloader: &PdfDownloader, references: &ReferenceSet) -> Result<usize> {
        let reports = downloader.download_all(references.papers(), &self.papers_dir()).await;
        let downloaded = reports.iter().filter(|r| r.status.is_downloaded()).count();
        self.report.downloads = reports;
        self.save_report()?;
        Ok(downloaded)
    }

    /// Archive a completed or cancelled run.
    pub fn record_output(&mut self, output: &PipelineOutput) -> Result<PathBuf> {
        self.write_artifacts(&output.document, &output.transcripts, &output.references)?;
        self.report.charts = output.charts.iter().map(ChartAudit::from).collect();
        self.report.warnings.extend(output.warnings.iter().cloned());
        let outcome = match &output.status {
            PipelineStatus::Completed => RunOutcome::Completed,
            PipelineStatus::Cancelled { stage } => RunOutcome::Cancelled { stage: *stage },
        };
        self.finish(outcome)
    }

    /// Archive whatever a failed run left behind.
    pub fn record_failure(&mut self, failure: &PipelineStageFailure) -> Result<PathBuf> {
        let partial = &failure.partial;
        if let Some(draft) = partial.best_draft() {
            self.write_document(draft)?;
        }
        self.write_json(TRANSCRIPTS_FILE, &partial.transcripts)?;
        self.write_json(REFERENCES_FILE, &partial.references)?;
        self.report.charts = partial.charts.iter().map(ChartAudit::from).collect();
        self.report.warnings.extend(partial.warnings.iter().cloned());
        self.finish(RunOutcome::Failed {
            stage: failure.stage,
            error: failure.source.to_string(),
        })
    }

    /// Mark the run failed before the pipeline produced anything.
    pub fn record_error(&mut self, stage: Stage, error: &str) -> Result<PathBuf> {
        self.finish(RunOutcome::Failed {
            stage,
            error: error.to_string(),
        })
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<PathBuf> {
        self.report.finish(outcome);
        self.save_report()?;
        Ok(self.run_dir.clone())
    }

    fn write_artifacts(
        &self,
        document: &DraftArtifact,
        transcripts: &[Transcript],
        references: &ReferenceSet,
    ) -> Result<()> {
        self.write_document(document)?;
        self.write_json(TRANSCRIPTS_FILE, &transcripts)?;
        self.write_json(REFERENCES_FILE, references)
    }

    fn write_document(&self, document: &DraftArtifact) -> Result<()> {
        let path = self.run_dir.join(DOCUMENT_FILE);
        fs::write(&path, document.render())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        let path = self.run_dir.join(name);
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn save_report(&self) -> Result<()> {
        self.write_json(REPORT_FILE, &self.report)
    }
}

/// Run directories under `runs_dir`, most recent first.
pub fn list_runs(runs_dir: &Path) -> Result<Vec<PathBuf>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs: Vec<PathBuf> = fs::read_dir(runs_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join(REPORT_FILE).is_file())
        .collect();

    runs.sort();
    runs.reverse();
    Ok(runs)
}

pub fn load_report(run_dir: &Path) -> Result<RunReport> {
    let path = run_dir.join(REPORT_FILE);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_loop::LoopState;
    use crate::draft::Section;
    use crate::errors::StageError;
    use crate::pipeline::{ChartReport, PartialArtifacts};
    use tempfile::TempDir;

    fn make_run_config() -> RunConfig {
        RunConfig {
            topic: "soil acidity".to_string(),
            project_dir: PathBuf::from("."),
            model_command: "claude".to_string(),
            perspectives: 3,
            rounds: 2,
            max_attempts: 3,
            inputs: Vec::new(),
            charts: vec!["pH by depth".to_string()],
        }
    }

    fn chart(title: &str, state: LoopState) -> ChartReport {
        ChartReport {
            title: title.to_string(),
            state,
            attempts_used: 2,
            figure: None,
            code: None,
            error: None,
            cancelled: false,
        }
    }

    #[test]
    fn test_start_writes_in_progress_report() {
        let dir = TempDir::new().unwrap();
        let archive = RunArchive::start(dir.path(), make_run_config()).unwrap();
        assert!(archive.figures_dir().is_dir());

        let report = load_report(archive.run_dir()).unwrap();
        assert_eq!(report.outcome, RunOutcome::InProgress);
        assert_eq!(report.config.topic, "soil acidity");
        assert_eq!(list_runs(dir.path()).unwrap(), vec![archive.run_dir().to_path_buf()]);
    }

    #[test]
    fn test_record_output_writes_all_files() {
        let dir = TempDir::new().unwrap();
        let mut archive = RunArchive::start(dir.path(), make_run_config()).unwrap();
        let output = PipelineOutput {
            status: PipelineStatus::Completed,
            document: DraftArtifact::seed("Soil", vec![Section::new("Intro", "Acid soils.")]),
            transcripts: vec![Transcript::new("outline")],
            references: ReferenceSet::default(),
            charts: vec![chart("pH by depth", LoopState::Succeeded)],
            warnings: vec!["notes.docx: unsupported input type, skipped".to_string()],
        };

        let run_dir = archive.record_output(&output).unwrap();
        let document = fs::read_to_string(run_dir.join(DOCUMENT_FILE)).unwrap();
        assert!(document.starts_with("# Soil"));
        assert!(run_dir.join(TRANSCRIPTS_FILE).is_file());
        assert!(run_dir.join(REFERENCES_FILE).is_file());

        let report = load_report(&run_dir).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.ended_at.is_some());
        assert_eq!(report.charts.len(), 1);
        assert_eq!(report.charts[0].state, LoopState::Succeeded);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_record_failure_keeps_partial_draft() {
        let dir = TempDir::new().unwrap();
        let mut archive = RunArchive::start(dir.path(), make_run_config()).unwrap();
        let partial = PartialArtifacts {
            outline: Some(DraftArtifact::seed("Outline only", vec![])),
            charts: vec![chart("pH by depth", LoopState::Failed)],
            ..Default::default()
        };
        let failure = PipelineStageFailure::new(
            Stage::Charts,
            StageError::ChartFailed {
                title: "pH by depth".to_string(),
                attempts: 3,
                detail: "exit 1".to_string(),
            },
            partial,
        );

        let run_dir = archive.record_failure(&failure).unwrap();
        let document = fs::read_to_string(run_dir.join(DOCUMENT_FILE)).unwrap();
        assert!(document.starts_with("# Outline only"));

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join(REPORT_FILE)).unwrap()).unwrap();
        assert_eq!(value["outcome"]["status"], "failed");
        assert_eq!(value["outcome"]["stage"], "charts");
        assert_eq!(value["charts"][0]["state"], "failed");
        assert_eq!(value["run_id"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_record_error_without_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut archive = RunArchive::start(dir.path(), make_run_config()).unwrap();
        let run_dir = archive.record_error(Stage::Outline, "no model").unwrap();
        assert!(!run_dir.join(DOCUMENT_FILE).exists());
        assert_eq!(
            load_report(&run_dir).unwrap().outcome.stage_reached(),
            Some(Stage::Outline)
        );
    }

    #[tokio::test]
    async fn test_download_papers_records_statuses() {
        use crate::references::PaperRecord;
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/soil.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 soil".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut references = ReferenceSet::new();
        references.resolve(
            "outline/r0-01",
            vec![
                PaperRecord::new("soil", "Soil", vec![], "").with_pdf_link(format!("{}/soil.pdf", server.uri())),
                PaperRecord::new("gone", "Gone", vec![], "").with_pdf_link(format!("{}/gone.pdf", server.uri())),
                PaperRecord::new("web", "Web only", vec![], "").with_link("https://example.org"),
            ],
        );

        let dir = TempDir::new().unwrap();
        let mut archive = RunArchive::start(dir.path(), make_run_config()).unwrap();
        let downloader = PdfDownloader::new(Duration::from_secs(5), 4, 0).unwrap();
        let saved = archive.download_papers(&downloader, &references).await.unwrap();

        assert_eq!(saved, 1);
        assert_eq!(fs::read_dir(archive.papers_dir()).unwrap().count(), 1);
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(archive.run_dir().join(REPORT_FILE)).unwrap()).unwrap();
        let downloads = value["downloads"].as_array().unwrap();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0]["source_id"], "gone");
        assert_eq!(downloads[0]["status"], "not_found");
        assert_eq!(downloads[1]["status"], "downloaded");
        assert!(downloads[1]["file"].as_str().unwrap().starts_with("papers/"));
    }

    #[test]
    fn test_list_runs_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(list_runs(&dir.path().join("nope")).unwrap().is_empty());
    }
}
