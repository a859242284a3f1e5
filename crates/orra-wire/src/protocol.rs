use serde::{Deserialize, Serialize};
use serde_json::Value;

use orra_types::{CompensationContext, PartialCompensation};

/// Hard cap on one framed message in either direction.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Messages the engine sends down a service channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    TaskRequest(TaskRequest),
    CompensationRequest(CompensationRequest),
    Ping { id: String },
    Ack { id: String },
}

impl EngineMessage {
    /// Requests carry work and are queued across disconnects; pings and acks
    /// are connection-local and never queued.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            EngineMessage::TaskRequest(_) | EngineMessage::CompensationRequest(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    pub input: Value,
}

/// Input handed to a compensation handler: the original task plus its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationInput {
    #[serde(rename = "originalTask")]
    pub original_task: Value,
    #[serde(rename = "taskResult")]
    pub task_result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRequest {
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    /// The original task being reverted.
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "compensationId")]
    pub compensation_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    pub input: CompensationInput,
    #[serde(rename = "compensationContext")]
    pub compensation_context: CompensationContext,
}

/// Every service-sent message travels inside an envelope the engine ACKs by
/// id. Services retry unacked envelopes on reconnect; the engine dedupes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub payload: ServiceMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    TaskResult(TaskResult),
    TaskInterimResult(TaskInterim),
    TaskAbortResult(TaskResult),
    TaskStatus(TaskStatusUpdate),
    Pong { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Completed,
    Partial,
}

/// Terminal outcome for a task or compensation dispatch. Abort may arrive
/// either as `task_abort_result` or as a `task_result` carrying an abort
/// payload; both are accepted on ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskResultStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialCompensation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "abortPayload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub abort_payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInterim {
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    pub payload: Value,
}

/// Informational status notification, e.g. a duplicate dispatch that is
/// already processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    #[serde(rename = "orchestrationId")]
    pub orchestration_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    pub status: String,
}

impl ServiceMessage {
    /// Orchestration the message belongs to, when it carries one.
    pub fn orchestration_id(&self) -> Option<&str> {
        match self {
            ServiceMessage::TaskResult(r) | ServiceMessage::TaskAbortResult(r) => {
                Some(&r.orchestration_id)
            }
            ServiceMessage::TaskInterimResult(i) => Some(&i.orchestration_id),
            ServiceMessage::TaskStatus(s) => Some(&s.orchestration_id),
            ServiceMessage::Pong { .. } => None,
        }
    }
}
