//! `report.tsv` generation: one row per run event.
//!
//! Columns: `timestamp_ms`, kind, attempt, unit, `duration_ms`, `exit_code`,
//!          status, message

use crate::events::EventPayload;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A single row in the report.tsv file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Event kind (e.g., `ATTEMPT_STARTED`, `UNIT_EXECUTED`).
    pub kind: String,
    pub attempt: Option<u32>,
    /// Unit ordinal within the attempt's response.
    pub unit: Option<usize>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    /// Short status word: attempt/run status, `ok`/`fail` for units.
    pub status: String,
    pub message: String,
}

impl ReportRow {
    pub fn new(timestamp_ms: i64, kind: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            kind: kind.into(),
            attempt: None,
            unit: None,
            duration_ms: None,
            exit_code: None,
            status: String::new(),
            message: String::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_unit(mut self, unit: usize) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Build the row for a run event.
    pub fn from_event(timestamp_ms: i64, event: &EventPayload) -> Self {
        let mut row = Self::new(timestamp_ms, event.event_type().as_str());
        if let Some(attempt) = event.attempt() {
            row = row.with_attempt(attempt);
        }
        match event {
            EventPayload::RunCreated(p) => row
                .with_status(p.intent.as_str())
                .with_message(format!(
                    "run={} target={} max_retries={} tests={}",
                    p.run_id,
                    p.target.as_str(),
                    p.max_retries,
                    p.tests.join(",")
                )),
            EventPayload::AttemptStarted(p) => {
                row.with_message(format!("instruction_chars={}", p.instruction_chars))
            }
            EventPayload::ResponseReceived(p) => row
                .with_duration_ms(p.duration_ms)
                .with_message(format!(
                    "response_chars={} blocks={} recovered={}",
                    p.response_chars, p.blocks, p.recovered
                )),
            EventPayload::UnitsClassified(p) => {
                let mut message = format!(
                    "programs={} commands={} discarded={} forced={}",
                    p.programs, p.commands, p.discarded, p.forced
                );
                if !p.warnings.is_empty() {
                    message.push_str(&format!(" warnings={}", p.warnings.join(" | ")));
                }
                row.with_message(message)
            }
            EventPayload::DependencyInstalled(p) => row
                .with_status(if p.success { "ok" } else { "fail" })
                .with_message(format!("package={}", p.package)),
            EventPayload::UnitExecuted(p) => {
                let mut row = row
                    .with_unit(p.unit)
                    .with_duration_ms(p.duration_ms)
                    .with_status(if p.success { "ok" } else { "fail" })
                    .with_message(format!(
                        "label={} timed_out={} tentative={}",
                        p.label, p.timed_out, p.tentative
                    ));
                if let Some(code) = p.exit_code {
                    row = row.with_exit_code(code);
                }
                row
            }
            EventPayload::AcceptanceEvaluated(p) => row
                .with_status(if p.failed.is_empty() { "ok" } else { "fail" })
                .with_message(format!(
                    "passed={} failed={}",
                    p.passed,
                    p.failed.join(",")
                )),
            EventPayload::AttemptFinished(p) => row
                .with_status(p.status.as_str())
                .with_message(format!("retrying={}", p.retrying)),
            EventPayload::RunFinished(p) => row
                .with_status(p.status.as_str())
                .with_message(format!(
                    "run={} attempts={} {}",
                    p.run_id,
                    p.attempts,
                    p.reason.as_deref().unwrap_or("")
                )),
        }
    }

    fn to_tsv_line(&self) -> String {
        let attempt = self.attempt.map(|a| a.to_string()).unwrap_or_default();
        let unit = self.unit.map(|u| u.to_string()).unwrap_or_default();
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let exit_code = self.exit_code.map(|c| c.to_string()).unwrap_or_default();

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind,
            attempt,
            unit,
            duration,
            exit_code,
            sanitize_field(&self.status),
            sanitize_field(self.message.trim_end()),
        )
    }
}

/// Tabs and newlines would break the row.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

const HEADER: &str =
    "timestamp_ms\tkind\tattempt\tunit\tduration_ms\texit_code\tstatus\tmessage";

/// Appending writer for report.tsv files.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Open for append, writing the header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Parse a report back into rows. Malformed lines are skipped.
pub fn read_report(path: &Path) -> std::io::Result<Vec<ReportRow>> {
    let content = std::fs::read_to_string(path)?;
    let rows = content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(8, '\t').collect();
            if cols.len() < 8 {
                return None;
            }
            Some(ReportRow {
                timestamp_ms: cols[0].parse().ok()?,
                kind: cols[1].to_string(),
                attempt: cols[2].parse().ok(),
                unit: cols[3].parse().ok(),
                duration_ms: cols[4].parse().ok(),
                exit_code: cols[5].parse().ok(),
                status: cols[6].to_string(),
                message: cols[7].to_string(),
            })
        })
        .collect();
    Ok(rows)
}
