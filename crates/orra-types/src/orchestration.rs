use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compensation::CompensationSummary;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Preparing,
    Processing,
    Paused,
    Completed,
    Failed,
    NotActionable,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::Failed
                | OrchestrationStatus::NotActionable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "pending",
            OrchestrationStatus::Preparing => "preparing",
            OrchestrationStatus::Processing => "processing",
            OrchestrationStatus::Paused => "paused",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::NotActionable => "not_actionable",
        }
    }
}

/// One named action parameter, order-preserving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub field: String,
    pub value: Value,
}

/// Durable orchestration header. Task records and the append-only log are
/// stored separately under their own keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: String,
    pub project_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Vec<ActionParam>,
    pub created_at: DateTime<Utc>,
    pub webhook_url: String,
    pub timeout_ms: u64,
    pub health_grace_period_ms: u64,
    pub status: OrchestrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub compensation: CompensationSummary,
}

impl Orchestration {
    pub fn sorted_param_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.iter().map(|p| p.field.clone()).collect();
        names.sort();
        names
    }
}
