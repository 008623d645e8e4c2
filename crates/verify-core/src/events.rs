//! Event types for the run report and transcript.

use crate::types::{AttemptStatus, Id, IntentCategory, PipelineStatus, TargetKind};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    AttemptStarted,
    ResponseReceived,
    UnitsClassified,
    DependencyInstalled,
    UnitExecuted,
    AcceptanceEvaluated,
    AttemptFinished,
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::AttemptStarted => "ATTEMPT_STARTED",
            Self::ResponseReceived => "RESPONSE_RECEIVED",
            Self::UnitsClassified => "UNITS_CLASSIFIED",
            Self::DependencyInstalled => "DEPENDENCY_INSTALLED",
            Self::UnitExecuted => "UNIT_EXECUTED",
            Self::AcceptanceEvaluated => "ACCEPTANCE_EVALUATED",
            Self::AttemptFinished => "ATTEMPT_FINISHED",
            Self::RunFinished => "RUN_FINISHED",
        }
    }
}

/// Payload for RUN_CREATED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Id,
    pub target: TargetKind,
    pub intent: IntentCategory,
    pub max_retries: u32,
    /// Names of the generated acceptance tests.
    pub tests: Vec<String>,
}

/// Payload for ATTEMPT_STARTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedPayload {
    pub run_id: Id,
    pub attempt: u32,
    pub instruction_chars: usize,
}

/// Payload for RESPONSE_RECEIVED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseReceivedPayload {
    pub attempt: u32,
    pub response_chars: usize,
    pub blocks: usize,
    /// Blocks came from the unfenced fallback.
    pub recovered: bool,
    pub duration_ms: u64,
}

/// Payload for UNITS_CLASSIFIED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsClassifiedPayload {
    pub attempt: u32,
    pub programs: usize,
    pub commands: usize,
    pub discarded: usize,
    pub forced: bool,
    pub warnings: Vec<String>,
}

/// Payload for DEPENDENCY_INSTALLED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyInstalledPayload {
    pub attempt: u32,
    pub package: String,
    pub success: bool,
}

/// Payload for UNIT_EXECUTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitExecutedPayload {
    pub attempt: u32,
    pub unit: usize,
    pub label: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub tentative: bool,
    pub duration_ms: u64,
}

/// Payload for ACCEPTANCE_EVALUATED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceEvaluatedPayload {
    pub attempt: u32,
    pub passed: usize,
    pub failed: Vec<String>,
}

/// Payload for ATTEMPT_FINISHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFinishedPayload {
    pub attempt: u32,
    pub status: AttemptStatus,
    /// Whether another attempt follows.
    pub retrying: bool,
}

/// Payload for RUN_FINISHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: Id,
    pub status: PipelineStatus,
    pub attempts: u32,
    pub reason: Option<String>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunCreated(RunCreatedPayload),
    AttemptStarted(AttemptStartedPayload),
    ResponseReceived(ResponseReceivedPayload),
    UnitsClassified(UnitsClassifiedPayload),
    DependencyInstalled(DependencyInstalledPayload),
    UnitExecuted(UnitExecutedPayload),
    AcceptanceEvaluated(AcceptanceEvaluatedPayload),
    AttemptFinished(AttemptFinishedPayload),
    RunFinished(RunFinishedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated(_) => EventType::RunCreated,
            Self::AttemptStarted(_) => EventType::AttemptStarted,
            Self::ResponseReceived(_) => EventType::ResponseReceived,
            Self::UnitsClassified(_) => EventType::UnitsClassified,
            Self::DependencyInstalled(_) => EventType::DependencyInstalled,
            Self::UnitExecuted(_) => EventType::UnitExecuted,
            Self::AcceptanceEvaluated(_) => EventType::AcceptanceEvaluated,
            Self::AttemptFinished(_) => EventType::AttemptFinished,
            Self::RunFinished(_) => EventType::RunFinished,
        }
    }

    /// Attempt ordinal the event belongs to, if any.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::RunCreated(_) | Self::RunFinished(_) => None,
            Self::AttemptStarted(p) => Some(p.attempt),
            Self::ResponseReceived(p) => Some(p.attempt),
            Self::UnitsClassified(p) => Some(p.attempt),
            Self::DependencyInstalled(p) => Some(p.attempt),
            Self::UnitExecuted(p) => Some(p.attempt),
            Self::AcceptanceEvaluated(p) => Some(p.attempt),
            Self::AttemptFinished(p) => Some(p.attempt),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
