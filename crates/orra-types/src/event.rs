use serde::{Deserialize, Serialize};

use crate::{CompensationStatus, OrchestrationStatus, TaskStatus};

/// In-process engine events published on the broadcast bus. Durable state
/// lives in the KV store; these exist so loops can react without polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrchestrationStatusChanged {
        orchestration_id: String,
        project_id: String,
        status: OrchestrationStatus,
    },
    TaskStatusChanged {
        orchestration_id: String,
        task_id: String,
        status: TaskStatus,
    },
    ServiceConnected {
        project_id: String,
        service_id: String,
    },
    ServiceDisconnected {
        project_id: String,
        service_id: String,
    },
    CompensationStatusChanged {
        orchestration_id: String,
        compensation_id: String,
        status: CompensationStatus,
    },
}
