use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use orra_core::{Engine, EngineConfig};
use orra_providers::PlanGenerator;
use orra_store::{BeginOutcome, IdempotencyState, IdempotencyStore, KvStore};
use orra_types::{
    ActionParam, OrchestrationStatus, PartialCompensation, Plan, ServiceRecord,
};
use orra_wire::{
    CompensationRequest, EngineMessage, Envelope, ServiceMessage, TaskInterim, TaskRequest,
    TaskResult, TaskResultStatus, TaskStatusUpdate,
};

/// Engine configuration tuned for fast tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        orchestration_timeout_ms: 5_000,
        health_grace_period_ms: 60_000,
        compensation_max_attempts: 2,
        compensation_attempt_budget_ms: 1_000,
        webhook_max_attempts: 1,
        ..EngineConfig::default()
    }
}

/// Plan generator double returning a fixed plan and counting invocations.
pub struct StaticGenerator {
    plan: Plan,
    pub calls: Arc<AtomicU32>,
}

impl StaticGenerator {
    pub fn new(plan: Plan) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                plan,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl PlanGenerator for StaticGenerator {
    async fn generate(
        &self,
        _action: &str,
        _params: &[ActionParam],
        _catalog: &[ServiceRecord],
        _grounding: Option<&Value>,
    ) -> anyhow::Result<Plan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.clone())
    }
}

/// Generator double that always fails, driving `not_actionable`.
pub struct FailingGenerator;

#[async_trait]
impl PlanGenerator for FailingGenerator {
    async fn generate(
        &self,
        _action: &str,
        _params: &[ActionParam],
        _catalog: &[ServiceRecord],
        _grounding: Option<&Value>,
    ) -> anyhow::Result<Plan> {
        anyhow::bail!("the reasoning model is unavailable")
    }
}

/// How the harness answers a task request.
#[derive(Clone)]
pub enum TaskBehavior {
    /// Complete with the request input echoed back.
    Echo,
    Complete(Value),
    /// Send one progress update, then complete.
    InterimThenComplete { interim: Value, result: Value },
    Fail(String),
    Abort(Value),
    /// Record the request but never answer; the test replies manually.
    Silent,
}

/// How the harness answers a compensation request.
#[derive(Clone)]
pub enum CompBehavior {
    Complete,
    Partial(PartialCompensation),
    Fail(String),
}

/// In-process stand-in for an SDK-backed service: attaches straight to the
/// connection manager and speaks the envelope protocol, including the
/// service-side idempotency rules.
pub struct ServiceHarness {
    engine: Arc<Engine>,
    pub project_id: String,
    pub service_id: String,
    generation: u64,
    pub task_executions: Arc<AtomicU32>,
    pub task_requests: Arc<Mutex<Vec<TaskRequest>>>,
    pub comp_requests: Arc<Mutex<Vec<CompensationRequest>>>,
    behavior: Arc<Mutex<TaskBehavior>>,
    comp_behavior: Arc<Mutex<CompBehavior>>,
    idempotency: IdempotencyStore,
}

impl ServiceHarness {
    pub async fn connect(
        engine: Arc<Engine>,
        project_id: &str,
        service_id: &str,
        behavior: TaskBehavior,
        comp_behavior: CompBehavior,
    ) -> Arc<Self> {
        // The harness keeps its own store, modelling the dedup an SDK runs
        // on the service side.
        let idempotency = IdempotencyStore::new(
            KvStore::open_in_memory().expect("in-memory store"),
            24 * 60 * 60 * 1000,
        );
        let harness = Arc::new(Self {
            engine: Arc::clone(&engine),
            project_id: project_id.to_string(),
            service_id: service_id.to_string(),
            generation: 0,
            task_executions: Arc::new(AtomicU32::new(0)),
            task_requests: Arc::new(Mutex::new(Vec::new())),
            comp_requests: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(behavior)),
            comp_behavior: Arc::new(Mutex::new(comp_behavior)),
            idempotency,
        });
        let attached = harness.attach().await;
        attached
    }

    /// (Re)open the service channel. Returns a harness carrying the fresh
    /// connection generation.
    pub async fn attach(&self) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self
            .engine
            .connections
            .attach(&self.project_id, &self.service_id, tx)
            .await;
        let pump = Arc::new(Self {
            engine: Arc::clone(&self.engine),
            project_id: self.project_id.clone(),
            service_id: self.service_id.clone(),
            generation,
            task_executions: Arc::clone(&self.task_executions),
            task_requests: Arc::clone(&self.task_requests),
            comp_requests: Arc::clone(&self.comp_requests),
            behavior: Arc::clone(&self.behavior),
            comp_behavior: Arc::clone(&self.comp_behavior),
            idempotency: self.idempotency.clone(),
        });
        let worker = Arc::clone(&pump);
        tokio::spawn(async move { worker.pump(rx).await });
        pump
    }

    pub async fn disconnect(&self) {
        self.engine
            .connections
            .detach(&self.service_id, self.generation)
            .await;
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                EngineMessage::TaskRequest(request) => self.on_task(request).await,
                EngineMessage::CompensationRequest(request) => self.on_comp(request).await,
                EngineMessage::Ping { id } => {
                    self.send(ServiceMessage::Pong { id }).await;
                }
                EngineMessage::Ack { .. } => {}
            }
        }
    }

    async fn on_task(&self, request: TaskRequest) {
        self.task_requests.lock().await.push(request.clone());
        match self
            .idempotency
            .begin(&self.service_id, &request.idempotency_key, &request.execution_id)
            .await
            .expect("idempotency begin")
        {
            BeginOutcome::Fresh => {
                let behavior = self.behavior.lock().await.clone();
                let reply = match behavior {
                    TaskBehavior::Echo => self.finish_task(&request, Some(request.input.clone()), None, None).await,
                    TaskBehavior::Complete(value) => {
                        self.finish_task(&request, Some(value), None, None).await
                    }
                    TaskBehavior::InterimThenComplete { interim, result } => {
                        self.send(ServiceMessage::TaskInterimResult(TaskInterim {
                            orchestration_id: request.orchestration_id.clone(),
                            task_id: request.task_id.clone(),
                            execution_id: request.execution_id.clone(),
                            payload: interim,
                        }))
                        .await;
                        self.finish_task(&request, Some(result), None, None).await
                    }
                    TaskBehavior::Fail(error) => {
                        self.finish_task(&request, None, Some(error), None).await
                    }
                    TaskBehavior::Abort(payload) => {
                        self.finish_task(&request, None, None, Some(payload)).await
                    }
                    TaskBehavior::Silent => None,
                };
                if let Some(reply) = reply {
                    self.send(reply).await;
                }
            }
            BeginOutcome::InProgress { .. } => {
                self.send(ServiceMessage::TaskStatus(TaskStatusUpdate {
                    orchestration_id: request.orchestration_id.clone(),
                    task_id: request.task_id.clone(),
                    idempotency_key: request.idempotency_key.clone(),
                    status: "in_progress".to_string(),
                }))
                .await;
            }
            BeginOutcome::Finished { entry } => {
                // Replay the cached terminal result verbatim.
                if let Some(cached) = entry.result {
                    if let Ok(result) = serde_json::from_value::<TaskResult>(cached) {
                        self.send(ServiceMessage::TaskResult(result)).await;
                    }
                }
            }
        }
    }

    /// Execute the behavior once and record the terminal result in the
    /// service-side idempotency store.
    async fn finish_task(
        &self,
        request: &TaskRequest,
        result: Option<Value>,
        error: Option<String>,
        abort: Option<Value>,
    ) -> Option<ServiceMessage> {
        self.task_executions.fetch_add(1, Ordering::SeqCst);
        let wire = TaskResult {
            orchestration_id: request.orchestration_id.clone(),
            task_id: request.task_id.clone(),
            execution_id: request.execution_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            status: None,
            result,
            partial: None,
            error,
            abort_payload: abort.clone(),
        };
        let state = if abort.is_some() {
            IdempotencyState::Aborted
        } else {
            IdempotencyState::Completed
        };
        self.idempotency
            .finish(
                &self.service_id,
                &request.idempotency_key,
                &request.execution_id,
                state,
                json!(wire),
            )
            .await
            .expect("idempotency finish");
        if abort.is_some() {
            Some(ServiceMessage::TaskAbortResult(wire))
        } else {
            Some(ServiceMessage::TaskResult(wire))
        }
    }

    async fn on_comp(&self, request: CompensationRequest) {
        self.comp_requests.lock().await.push(request.clone());
        let behavior = self.comp_behavior.lock().await.clone();
        let (status, partial, error) = match behavior {
            CompBehavior::Complete => (Some(TaskResultStatus::Completed), None, None),
            CompBehavior::Partial(partial) => (Some(TaskResultStatus::Partial), Some(partial), None),
            CompBehavior::Fail(error) => (None, None, Some(error)),
        };
        self.send(ServiceMessage::TaskResult(TaskResult {
            orchestration_id: request.orchestration_id.clone(),
            task_id: request.task_id.clone(),
            execution_id: request.execution_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            status,
            result: Some(json!({"reverted": true})),
            partial,
            error,
            abort_payload: None,
        }))
        .await;
    }

    /// Push one service message into the engine, wrapped in a fresh envelope.
    pub async fn send(&self, message: ServiceMessage) {
        let envelope = Envelope {
            id: orra_types::new_envelope_id(),
            payload: message,
        };
        self.engine
            .handle_envelope(&self.project_id, &self.service_id, envelope)
            .await;
    }
}

/// Poll until the orchestration reaches `status` or the deadline passes.
pub async fn wait_for_status(
    engine: &Arc<Engine>,
    project_id: &str,
    orchestration_id: &str,
    status: OrchestrationStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = engine
            .orchestrator
            .get(project_id, orchestration_id)
            .await
            .expect("orchestration exists");
        if current.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {status:?}; currently {:?}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll an arbitrary condition.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
