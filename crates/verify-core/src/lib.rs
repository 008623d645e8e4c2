pub mod acceptance;
pub mod classify;
pub mod config;
pub mod deps;
pub mod events;
pub mod extract;
pub mod intent;
pub mod naming;
pub mod outcome;
pub mod prompt;
pub mod record;
pub mod report;
pub mod shell;
pub mod types;

pub use acceptance::{AcceptanceTest, Evaluator, Snapshot};
pub use classify::{Classification, classify_all};
pub use config::Config;
pub use extract::{Extraction, ExtractionHints, extract};
pub use outcome::ExecutionOutcome;
pub use record::RunRecord;
pub use report::{ReportRow, ReportWriter};
pub use types::*;

use regex::Regex;

/// Compile a pattern that ships with the crate. These are fixed at build
/// time and covered by tests, so a failure here is a programming error.
pub(crate) fn static_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid built-in pattern {pattern:?}: {err}"),
    }
}
