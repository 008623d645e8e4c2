//! Persisted run record: `transcript.md`, `report.tsv` and `run.json`.
//!
//! The transcript is append-only markdown with every instruction, response,
//! extraction result, execution result, verdict and feedback in order. The
//! report gets one row per run event. `run.json` is rewritten at the end.

use crate::workspace::RunLayout;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use thiserror::Error;
use tracing::debug;
use verify_core::events::EventPayload;
use verify_core::record::RecordError;
use verify_core::{Config, PipelineRun, ReportRow, ReportWriter, RunRecord};

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, TranscriptError>;

/// Fence long enough that triple-backtick blocks in a response stay intact.
const FENCE: &str = "````";

#[derive(Debug)]
pub struct Transcript {
    layout: RunLayout,
    file: File,
    report: ReportWriter,
}

impl Transcript {
    /// Open the run's record files and write the transcript header.
    pub fn create(layout: &RunLayout, run: &PipelineRun) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.transcript_path())?;
        writeln!(file, "# Verification run {}", run.id)?;
        writeln!(file)?;
        writeln!(file, "- Task: {}", run.task)?;
        writeln!(file, "- Target: {} ({})", run.target.describe(), run.target.work_dir)?;
        writeln!(file, "- Intent: {}", run.intent.as_str())?;
        writeln!(file, "- Max retries: {}", run.max_retries)?;
        writeln!(file, "- Started: {}", run.created_at.to_rfc3339())?;
        writeln!(file)?;
        file.flush()?;

        let report = ReportWriter::new(&layout.report_path())?;
        Ok(Self {
            layout: layout.clone(),
            file,
            report,
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Append a heading.
    pub fn heading(&mut self, title: &str) -> Result<()> {
        writeln!(self.file, "## {title}")?;
        writeln!(self.file)?;
        self.file.flush()?;
        Ok(())
    }

    /// Append a titled, fenced body.
    pub fn section(&mut self, title: &str, body: &str) -> Result<()> {
        writeln!(self.file, "### {title}")?;
        writeln!(self.file)?;
        writeln!(self.file, "{FENCE}")?;
        writeln!(self.file, "{}", body.trim_end())?;
        writeln!(self.file, "{FENCE}")?;
        writeln!(self.file)?;
        self.file.flush()?;
        Ok(())
    }

    /// Append a plain line.
    pub fn note(&mut self, text: &str) -> Result<()> {
        writeln!(self.file, "{text}")?;
        writeln!(self.file)?;
        self.file.flush()?;
        Ok(())
    }

    /// Record an event as a report row.
    pub fn event(&mut self, event: &EventPayload) -> Result<()> {
        let row = ReportRow::from_event(Utc::now().timestamp_millis(), event);
        debug!(kind = %row.kind, attempt = ?row.attempt, "report row");
        self.report.write_row(&row)?;
        self.report.flush()?;
        Ok(())
    }

    /// Write `run.json`.
    pub fn write_record(&self, run: &PipelineRun, config: &Config) -> Result<()> {
        RunRecord::new(run, config).write(&self.layout.record_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use verify_core::events::AttemptStartedPayload;
    use verify_core::report::read_report;
    use verify_core::{Id, IntentCategory, PipelineStatus, Target};

    fn setup(dir: &TempDir) -> (RunLayout, PipelineRun) {
        let run = PipelineRun::new(
            "print hello",
            Target::local("/tmp/x"),
            IntentCategory::Generic,
            1,
        );
        let layout = RunLayout::create(dir.path(), &run.id, None).unwrap();
        (layout, run)
    }

    #[test]
    fn transcript_keeps_sections_in_order() {
        let dir = TempDir::new().unwrap();
        let (layout, run) = setup(&dir);
        let mut transcript = Transcript::create(&layout, &run).unwrap();
        transcript.heading("Attempt 1").unwrap();
        transcript.section("Instruction", "TASK: print hello").unwrap();
        transcript
            .section("Response", "```python\nprint('hello')\n```\n")
            .unwrap();

        let text = std::fs::read_to_string(layout.transcript_path()).unwrap();
        assert!(text.starts_with(&format!("# Verification run {}", run.id)));
        let instruction = text.find("### Instruction").unwrap();
        let response = text.find("### Response").unwrap();
        assert!(instruction < response);
        assert!(text.contains("````\n```python\nprint('hello')\n```\n````"));
    }

    #[test]
    fn events_become_report_rows() {
        let dir = TempDir::new().unwrap();
        let (layout, run) = setup(&dir);
        let mut transcript = Transcript::create(&layout, &run).unwrap();
        transcript
            .event(&EventPayload::AttemptStarted(AttemptStartedPayload {
                run_id: Id::from_string("r"),
                attempt: 1,
                instruction_chars: 42,
            }))
            .unwrap();

        let rows = read_report(&layout.report_path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "ATTEMPT_STARTED");
        assert_eq!(rows[0].attempt, Some(1));
    }

    #[test]
    fn record_is_written_to_run_dir() {
        let dir = TempDir::new().unwrap();
        let (layout, mut run) = setup(&dir);
        let transcript = Transcript::create(&layout, &run).unwrap();
        run.finalize(PipelineStatus::Failed);
        transcript.write_record(&run, &Config::default()).unwrap();

        let record = RunRecord::read(&layout.record_path()).unwrap();
        assert_eq!(record.run.status, PipelineStatus::Failed);
    }
}
