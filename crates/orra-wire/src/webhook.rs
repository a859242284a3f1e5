use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const USER_AGENT: &str = "orra/1.0";
pub const HEADER_EVENT: &str = "X-Orra-Event";

pub const EVENT_ORCHESTRATION_COMPLETED: &str = "orchestration.completed";
pub const EVENT_ORCHESTRATION_FAILED: &str = "orchestration.failed";
pub const EVENT_COMPENSATION_FAILED: &str = "compensation.failed";

/// Outbound webhook payload. `event_id` is minted once at enqueue time and
/// preserved across delivery retries so recipients can dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}
