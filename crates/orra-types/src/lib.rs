mod compensation;
mod error;
mod event;
mod ids;
mod log;
mod orchestration;
mod plan;
mod project;
mod service;
mod task;

pub use compensation::{
    CompensationContext, CompensationReason, CompensationRecord, CompensationStatus,
    CompensationSummary, PartialCompensation, ResolutionState, COMPENSATION_MAX_ATTEMPTS,
};
pub use error::{OrraError, Result};
pub use event::EngineEvent;
pub use ids::{
    new_compensation_id, new_envelope_id, new_event_id, new_execution_id, new_orchestration_id,
    new_project_id, new_service_id,
};
pub use log::{LogEntry, LogEntryKind};
pub use orchestration::{ActionParam, Orchestration, OrchestrationStatus};
pub use plan::{parse_reference, Plan, PlanTask, Reference, TASK_ZERO_ID};
pub use project::Project;
pub use service::{validate_service_name, ServiceKind, ServiceRecord, ServiceSchema};
pub use task::{InterimUpdate, TaskRecord, TaskStatus};
