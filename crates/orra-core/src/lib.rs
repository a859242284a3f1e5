mod compensation;
mod config;
mod connections;
mod engine;
mod events;
mod orchestrator;
mod projects;
mod registry;
mod webhook;

pub use compensation::{backoff_delay, CompensationService};
pub use config::EngineConfig;
pub use connections::{ConnectionManager, ConnectionSettings, SendOutcome};
pub use engine::Engine;
pub use events::EventHub;
pub use orchestrator::{
    compensation_idempotency_key, fold_log, task_idempotency_key, FoldedTask, InspectionResponse,
    Orchestrator, ReplayState, StatusTransition, SubmitRequest, TaskScheduler,
};
pub use projects::ProjectStore;
pub use registry::{RegistrationSpec, ServiceRegistry};
pub use webhook::WebhookNotifier;
