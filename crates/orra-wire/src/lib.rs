mod error_body;
mod protocol;
mod reconnect;
mod webhook;

pub use error_body::{ApiErrorBody, ApiErrorDetail};
pub use protocol::{
    CompensationInput, CompensationRequest, EngineMessage, Envelope, ServiceMessage, TaskInterim,
    TaskRequest, TaskResult, TaskResultStatus, TaskStatusUpdate, MAX_MESSAGE_BYTES,
};
pub use reconnect::ReconnectPolicy;
pub use webhook::{
    WebhookEvent, EVENT_COMPENSATION_FAILED, EVENT_ORCHESTRATION_COMPLETED,
    EVENT_ORCHESTRATION_FAILED, HEADER_EVENT, USER_AGENT,
};
