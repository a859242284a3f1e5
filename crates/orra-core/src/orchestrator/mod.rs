mod driver;
mod replay;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use orra_plancache::PlanCache;
use orra_providers::{PlanGenerator, PlanValidator};
use orra_store::{keys, KvStore, LogStore};
use orra_types::{
    new_orchestration_id, ActionParam, CompensationRecord, CompensationSummary, LogEntry,
    Orchestration, OrchestrationStatus, OrraError, Project, Result, TaskRecord,
};
use orra_wire::ServiceMessage;

use crate::config::EngineConfig;
use crate::connections::ConnectionManager;
use crate::events::EventHub;
use crate::projects::ProjectStore;
use crate::registry::ServiceRegistry;
use crate::webhook::WebhookNotifier;

pub use replay::{fold_log, FoldedTask, ReplayState};
pub use scheduler::TaskScheduler;

/// Everything a driver needs, shared by reference.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub kv: KvStore,
    pub log: LogStore,
    pub projects: ProjectStore,
    pub registry: ServiceRegistry,
    pub connections: Arc<ConnectionManager>,
    pub plan_cache: PlanCache,
    pub generator: Arc<dyn PlanGenerator>,
    pub validator: Arc<dyn PlanValidator>,
    pub webhooks: WebhookNotifier,
    pub events: EventHub,
    pub shutdown: CancellationToken,
}

/// An action submission, already parsed by the API layer.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub action: String,
    pub params: Vec<ActionParam>,
    pub webhook: String,
    pub timeout_ms: Option<u64>,
    pub health_grace_period_ms: Option<u64>,
}

/// Full inspection payload for one orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionResponse {
    pub orchestration: Orchestration,
    pub tasks: Vec<TaskRecord>,
    /// Status transitions in log order.
    pub status_history: Vec<StatusTransition>,
    pub compensations: Vec<CompensationRecord>,
    pub log: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub timestamp: DateTime<Utc>,
    pub status: OrchestrationStatus,
}

/// The orchestration runtime: accepts submissions, spawns one driver per
/// orchestration and routes inbound service messages to it.
pub struct Orchestrator {
    shared: Arc<Shared>,
    drivers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ServiceMessage>>>>,
}

impl Orchestrator {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            drivers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Create an orchestration and start driving it. Returns synchronously;
    /// all further progress is delivered through webhooks.
    pub async fn submit(
        &self,
        project: &Project,
        request: SubmitRequest,
    ) -> Result<Orchestration> {
        if request.action.trim().is_empty() {
            return Err(OrraError::validation_param("action", "action is required"));
        }
        if request.webhook.is_empty() && project.webhooks.is_empty() {
            return Err(OrraError::validation_param(
                "webhook",
                "an orchestration webhook is required",
            ));
        }
        let orchestration = Orchestration {
            id: new_orchestration_id(),
            project_id: project.id.clone(),
            action: request.action,
            params: request.params,
            created_at: Utc::now(),
            webhook_url: request.webhook,
            timeout_ms: request
                .timeout_ms
                .unwrap_or(self.shared.config.orchestration_timeout_ms),
            health_grace_period_ms: request
                .health_grace_period_ms
                .unwrap_or(self.shared.config.health_grace_period_ms),
            status: OrchestrationStatus::Pending,
            plan: None,
            results: None,
            error: None,
            compensation: CompensationSummary::default(),
        };
        self.shared
            .kv
            .put(
                &keys::orchestration_key(&project.id, &orchestration.id),
                &orchestration,
            )
            .await?;
        tracing::info!(
            target: "orra.core",
            orchestration_id = %orchestration.id,
            project_id = %project.id,
            "orchestration submitted"
        );
        self.spawn_driver(orchestration.clone()).await;
        Ok(orchestration)
    }

    async fn spawn_driver(&self, orchestration: Orchestration) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.drivers
            .write()
            .await
            .insert(orchestration.id.clone(), tx);
        let drivers = Arc::clone(&self.drivers);
        let shared = Arc::clone(&self.shared);
        let orchestration_id = orchestration.id.clone();
        tokio::spawn(async move {
            driver::run(shared, orchestration, rx).await;
            drivers.write().await.remove(&orchestration_id);
        });
    }

    /// Route an inbound service message to the orchestration driver that owns
    /// it. Unroutable messages are dropped; services retry unacked envelopes
    /// and idempotency absorbs redelivery.
    pub async fn route(&self, service_id: &str, message: ServiceMessage) {
        let Some(orchestration_id) = message.orchestration_id().map(str::to_string) else {
            return;
        };
        let drivers = self.drivers.read().await;
        match drivers.get(&orchestration_id) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                tracing::debug!(
                    target: "orra.core",
                    service_id,
                    orchestration_id = %orchestration_id,
                    "message for unknown or finished orchestration dropped"
                );
            }
        }
    }

    pub async fn get(&self, project_id: &str, orchestration_id: &str) -> Result<Orchestration> {
        self.shared
            .kv
            .get(&keys::orchestration_key(project_id, orchestration_id))
            .await?
            .ok_or_else(|| OrraError::NotFound(format!("orchestration {orchestration_id}")))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Orchestration>> {
        let entries: Vec<(String, Orchestration)> = self
            .shared
            .kv
            .list_prefix(&keys::orchestration_prefix(project_id))
            .await?;
        Ok(entries.into_iter().map(|(_, o)| o).collect())
    }

    pub async fn inspect(
        &self,
        project_id: &str,
        orchestration_id: &str,
    ) -> Result<InspectionResponse> {
        let orchestration = self.get(project_id, orchestration_id).await?;
        let tasks: Vec<(String, TaskRecord)> = self
            .shared
            .kv
            .list_prefix(&keys::task_prefix(orchestration_id))
            .await?;
        let compensations: Vec<(String, CompensationRecord)> = self
            .shared
            .kv
            .list_prefix(&keys::compensation_prefix(orchestration_id))
            .await?;
        let log = self.shared.log.read(orchestration_id).await?;
        let status_history = log
            .iter()
            .filter(|entry| entry.kind == orra_types::LogEntryKind::OrchestrationStatus)
            .filter_map(|entry| {
                serde_json::from_value::<OrchestrationStatus>(entry.payload["status"].clone())
                    .ok()
                    .map(|status| StatusTransition {
                        timestamp: entry.timestamp,
                        status,
                    })
            })
            .collect();
        Ok(InspectionResponse {
            orchestration,
            tasks: tasks.into_iter().map(|(_, t)| t).collect(),
            status_history,
            compensations: compensations.into_iter().map(|(_, c)| c).collect(),
            log,
        })
    }

    /// Restart recovery: respawn a driver for every orchestration that is not
    /// yet settled. Drivers fold the log, redispatch anything dispatched but
    /// not terminal and resume unfinished compensation.
    pub async fn recover(&self) -> Result<usize> {
        let projects: Vec<(String, Project)> =
            self.shared.kv.list_prefix(keys::project_prefix()).await?;
        let mut resumed = 0;
        for (_, project) in projects {
            for orchestration in self.list(&project.id).await? {
                let unsettled_compensation = orchestration.status == OrchestrationStatus::Failed
                    && !orchestration.compensation.is_settled();
                if orchestration.status.is_terminal() && !unsettled_compensation {
                    continue;
                }
                tracing::info!(
                    target: "orra.core",
                    orchestration_id = %orchestration.id,
                    status = orchestration.status.as_str(),
                    "resuming orchestration after restart"
                );
                self.spawn_driver(orchestration).await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }
}

/// Deterministic over (orchestration, task): stable across redispatches.
pub fn task_idempotency_key(orchestration_id: &str, task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(orchestration_id.as_bytes());
    hasher.update(b":");
    hasher.update(task_id.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Compensations get their own key space so a revert never collides with the
/// original execution.
pub fn compensation_idempotency_key(orchestration_id: &str, task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"comp:");
    hasher.update(orchestration_id.as_bytes());
    hasher.update(b":");
    hasher.update(task_id.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}
