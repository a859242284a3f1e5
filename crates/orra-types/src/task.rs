use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    Aborted,
    Compensating,
    Compensated,
    CompensationFailed,
    CompensationPartial,
    CompensationExpired,
}

impl TaskStatus {
    /// Terminal for execution purposes. Compensation statuses layer on top of
    /// an already-terminal task.
    pub fn is_execution_terminal(self) -> bool {
        !matches!(
            self,
            TaskStatus::Pending | TaskStatus::Dispatched | TaskStatus::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Compensating => "compensating",
            TaskStatus::Compensated => "compensated",
            TaskStatus::CompensationFailed => "compensation_failed",
            TaskStatus::CompensationPartial => "compensation_partial",
            TaskStatus::CompensationExpired => "compensation_expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterimUpdate {
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

/// Per-task execution record within an orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub orchestration_id: String,
    pub service_id: String,
    pub service_name: String,
    /// Frozen at plan preparation time.
    pub service_version: u64,
    /// Deterministic over (orchestration_id, task_id); stable across
    /// redispatches.
    pub idempotency_key: String,
    /// Fresh per dispatch attempt.
    pub execution_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_payload: Option<Value>,
    #[serde(default)]
    pub interim_updates: Vec<InterimUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}
