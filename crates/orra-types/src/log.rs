use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every task-lifecycle and compensation event recorded per orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryKind {
    OrchestrationStarted,
    OrchestrationStatus,
    TaskDispatched,
    TaskStatus,
    TaskInterim,
    TaskCompleted,
    TaskFailed,
    TaskAborted,
    CompensationScheduled,
    CompensationDispatched,
    CompensationAttempted,
    CompensationCompleted,
    CompensationPartial,
    CompensationFailed,
    CompensationExpired,
}

impl LogEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogEntryKind::OrchestrationStarted => "orchestration_started",
            LogEntryKind::OrchestrationStatus => "orchestration_status",
            LogEntryKind::TaskDispatched => "task_dispatched",
            LogEntryKind::TaskStatus => "task_status",
            LogEntryKind::TaskInterim => "task_interim",
            LogEntryKind::TaskCompleted => "task_completed",
            LogEntryKind::TaskFailed => "task_failed",
            LogEntryKind::TaskAborted => "task_aborted",
            LogEntryKind::CompensationScheduled => "compensation_scheduled",
            LogEntryKind::CompensationDispatched => "compensation_dispatched",
            LogEntryKind::CompensationAttempted => "compensation_attempted",
            LogEntryKind::CompensationCompleted => "compensation_completed",
            LogEntryKind::CompensationPartial => "compensation_partial",
            LogEntryKind::CompensationFailed => "compensation_failed",
            LogEntryKind::CompensationExpired => "compensation_expired",
        }
    }
}

/// One entry in an orchestration's append-only log. Offsets are strictly
/// monotone within an orchestration; the log is the replay source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LogEntryKind,
    /// Task (or compensation) the entry belongs to; empty for
    /// orchestration-level entries.
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub payload: Value,
}
