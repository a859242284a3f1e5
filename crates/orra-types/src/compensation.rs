use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMPENSATION_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
    Expired,
}

impl CompensationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CompensationStatus::Completed
                | CompensationStatus::Partial
                | CompensationStatus::Failed
                | CompensationStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompensationStatus::Pending => "pending",
            CompensationStatus::Processing => "processing",
            CompensationStatus::Completed => "completed",
            CompensationStatus::Partial => "partial",
            CompensationStatus::Failed => "failed",
            CompensationStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Pending,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationReason {
    OrchestrationFailed,
    Aborted,
}

/// Carried on every compensation_request so handlers can see why the revert
/// is happening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationContext {
    pub reason: CompensationReason,
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A partial outcome reported by a compensation handler. Partial results are
/// terminal and never retried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialCompensation {
    #[serde(default)]
    pub completed: Vec<Value>,
    #[serde(default)]
    pub remaining: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub id: String,
    pub task_id: String,
    pub orchestration_id: String,
    pub service_id: String,
    pub service_name: String,
    pub original_task_input: Value,
    pub original_task_result: Value,
    /// Completion instant of the original task; orders the revert cascade.
    pub original_completed_at: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: CompensationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<CompensationContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialCompensation>,
    pub resolution_state: ResolutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CompensationRecord {
    /// Operator resolution is only legal once, and only for failed or
    /// expired records.
    pub fn can_resolve(&self) -> bool {
        self.resolution_state == ResolutionState::Pending
            && matches!(
                self.status,
                CompensationStatus::Failed | CompensationStatus::Expired
            )
    }
}

/// Derived per-orchestration rollup surfaced on the header and inspections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompensationSummary {
    pub total: u32,
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    pub partial: u32,
    pub failed: u32,
    pub expired: u32,
}

impl CompensationSummary {
    pub fn from_records<'a>(records: impl Iterator<Item = &'a CompensationRecord>) -> Self {
        let mut summary = CompensationSummary::default();
        for record in records {
            summary.total += 1;
            match record.status {
                CompensationStatus::Pending => summary.pending += 1,
                CompensationStatus::Processing => summary.processing += 1,
                CompensationStatus::Completed => summary.completed += 1,
                CompensationStatus::Partial => summary.partial += 1,
                CompensationStatus::Failed => summary.failed += 1,
                CompensationStatus::Expired => summary.expired += 1,
            }
        }
        summary
    }

    /// True once every owed compensation reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
