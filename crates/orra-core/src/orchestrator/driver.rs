use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use orra_store::keys;
use orra_types::{
    new_compensation_id, new_execution_id, parse_reference, CompensationReason,
    CompensationRecord, CompensationStatus, CompensationSummary, EngineEvent, InterimUpdate,
    LogEntryKind, Orchestration, OrchestrationStatus, OrraError, Plan, ResolutionState, Result,
    ServiceRecord, TaskRecord, TaskStatus,
};
use orra_wire::{
    EngineMessage, ServiceMessage, TaskInterim, TaskRequest, TaskResult, TaskStatusUpdate,
};

use crate::compensation;
use crate::connections::SendOutcome;
use crate::orchestrator::scheduler::TaskScheduler;
use crate::orchestrator::{fold_log, task_idempotency_key, Shared};

/// Why an orchestration is transitioning to `failed`.
pub(crate) struct FailContext {
    pub task_id: String,
    pub error: Value,
    pub reason: CompensationReason,
    pub abort_payload: Option<Value>,
}

struct TaskTimer {
    deadline: Instant,
    /// Offline crediting never extends past this.
    hard_deadline: Instant,
    /// Time left when the owning service went offline.
    frozen_remaining: Option<Duration>,
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    orch: Orchestration,
    catalog: HashMap<String, ServiceRecord>,
    tasks: HashMap<String, TaskRecord>,
    deps: HashMap<String, BTreeSet<String>>,
    inputs: HashMap<String, Map<String, Value>>,
    outputs: HashMap<String, Value>,
    timers: HashMap<String, TaskTimer>,
    paused_since: Option<Instant>,
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    orchestration: Orchestration,
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
) {
    let orchestration_id = orchestration.id.clone();
    let mut driver = Driver {
        shared,
        orch: orchestration,
        catalog: HashMap::new(),
        tasks: HashMap::new(),
        deps: HashMap::new(),
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        timers: HashMap::new(),
        paused_since: None,
        rx,
    };
    if let Err(err) = driver.drive().await {
        tracing::error!(
            target: "orra.core",
            orchestration_id = %orchestration_id,
            error = %err,
            "orchestration driver ended with error"
        );
    }
}

impl Driver {
    async fn drive(&mut self) -> Result<()> {
        match self.orch.status {
            OrchestrationStatus::Pending | OrchestrationStatus::Preparing => {
                if !self.prepare().await? {
                    return Ok(());
                }
                self.execute().await
            }
            OrchestrationStatus::Processing | OrchestrationStatus::Paused => {
                self.load_execution_state().await?;
                self.redispatch_inflight().await?;
                self.execute().await
            }
            OrchestrationStatus::Failed => {
                self.load_execution_state().await?;
                self.resume_compensation().await
            }
            OrchestrationStatus::Completed | OrchestrationStatus::NotActionable => Ok(()),
        }
    }

    // ---- preparation -----------------------------------------------------

    /// Obtain and freeze a plan. Returns false when the orchestration ended
    /// `not_actionable`.
    async fn prepare(&mut self) -> Result<bool> {
        self.set_status(OrchestrationStatus::Preparing).await?;

        let catalog = self.shared.registry.list(&self.orch.project_id).await?;
        let digest = self
            .shared
            .registry
            .catalog_digest(&self.orch.project_id)
            .await?;

        let cached = self
            .shared
            .plan_cache
            .lookup(&self.orch.project_id, &self.orch.action, &self.orch.params, &digest)
            .await?;

        let mut plan = match cached {
            Some(plan) => plan,
            None => {
                let generated = match self
                    .shared
                    .generator
                    .generate(&self.orch.action, &self.orch.params, &catalog, None)
                    .await
                {
                    Ok(plan) => plan,
                    Err(err) => {
                        return self
                            .not_actionable(format!("plan generation failed: {err}"))
                            .await
                            .map(|_| false);
                    }
                };
                if let Err(reason) =
                    self.shared
                        .validator
                        .validate(&generated, &catalog, &self.orch.params)
                {
                    return self.not_actionable(reason).await.map(|_| false);
                }
                self.shared
                    .plan_cache
                    .insert(
                        &self.orch.project_id,
                        &self.orch.action,
                        &self.orch.params,
                        &digest,
                        &generated,
                    )
                    .await?;
                generated
            }
        };

        // Authoritative parameter binding into Task Zero.
        if let Some(task_zero) = plan.tasks.iter_mut().find(|t| t.is_task_zero()) {
            for param in &self.orch.params {
                task_zero
                    .input
                    .insert(param.field.clone(), param.value.clone());
            }
        }

        // Resolve every service name to a concrete (id, version), frozen for
        // the orchestration's lifetime.
        let by_name: HashMap<&str, &ServiceRecord> =
            catalog.iter().map(|s| (s.name.as_str(), s)).collect();
        for task in plan.tasks.iter_mut().filter(|t| !t.is_task_zero()) {
            let Some(service) = by_name.get(task.service.as_str()) else {
                let reason = format!("plan references unregistered service {:?}", task.service);
                return self.not_actionable(reason).await.map(|_| false);
            };
            task.service_id = Some(service.id.clone());
            task.service_version = Some(service.version);
        }

        self.catalog = catalog.into_iter().map(|s| (s.id.clone(), s)).collect();
        self.build_execution_state(&plan)?;
        self.orch.plan = Some(plan);
        self.persist_orchestration().await?;
        for task in self.tasks.values() {
            self.save_task(task).await?;
        }

        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::OrchestrationStarted,
                "",
                json!({
                    "action": self.orch.action,
                    "params": self.orch.params,
                }),
            )
            .await?;
        self.set_status(OrchestrationStatus::Processing).await?;
        Ok(true)
    }

    fn build_execution_state(&mut self, plan: &Plan) -> Result<()> {
        self.deps = plan.dependency_map()?;
        self.inputs.clear();
        self.outputs.clear();
        self.tasks.clear();

        if let Some(task_zero) = plan.task_zero() {
            self.outputs.insert(
                task_zero.id.clone(),
                Value::Object(task_zero.input.clone()),
            );
        }
        for task in plan.executable_tasks() {
            self.inputs.insert(task.id.clone(), task.input.clone());
            let service_id = task
                .service_id
                .clone()
                .ok_or_else(|| OrraError::Internal(format!("task {} has no frozen service", task.id)))?;
            self.tasks.insert(
                task.id.clone(),
                TaskRecord {
                    task_id: task.id.clone(),
                    orchestration_id: self.orch.id.clone(),
                    service_id,
                    service_name: task.service.clone(),
                    service_version: task.service_version.unwrap_or(1),
                    idempotency_key: task_idempotency_key(&self.orch.id, &task.id),
                    execution_id: new_execution_id(),
                    status: TaskStatus::Pending,
                    input: None,
                    output: None,
                    error: None,
                    abort_payload: None,
                    interim_updates: Vec::new(),
                    started_at: None,
                    ended_at: None,
                },
            );
        }
        Ok(())
    }

    /// Rebuild in-memory execution state for a resumed orchestration: task
    /// records from the KV store, reconciled against the folded log.
    async fn load_execution_state(&mut self) -> Result<()> {
        let plan = self
            .orch
            .plan
            .clone()
            .ok_or_else(|| OrraError::Internal("resumed orchestration has no plan".into()))?;

        let catalog = self.shared.registry.list(&self.orch.project_id).await?;
        self.catalog = catalog.into_iter().map(|s| (s.id.clone(), s)).collect();

        self.deps = plan.dependency_map()?;
        self.inputs.clear();
        self.outputs.clear();
        if let Some(task_zero) = plan.task_zero() {
            self.outputs.insert(
                task_zero.id.clone(),
                Value::Object(task_zero.input.clone()),
            );
        }
        for task in plan.executable_tasks() {
            self.inputs.insert(task.id.clone(), task.input.clone());
        }

        let stored: Vec<(String, TaskRecord)> = self
            .shared
            .kv
            .list_prefix(&keys::task_prefix(&self.orch.id))
            .await?;
        self.tasks = stored.into_iter().map(|(_, t)| (t.task_id.clone(), t)).collect();

        // The log is the source of truth: fold it and overlay any outcome the
        // task records missed (e.g. a crash between log append and record save).
        let folded = fold_log(&self.shared.log.read(&self.orch.id).await?);
        for (task_id, folded_task) in &folded.tasks {
            let Some(record) = self.tasks.get_mut(task_id) else {
                continue;
            };
            if folded_task.status.is_execution_terminal()
                && !record.status.is_execution_terminal()
            {
                record.status = folded_task.status;
                record.output = folded_task.output.clone();
                record.error = folded_task.error.clone();
                record.abort_payload = folded_task.abort_payload.clone();
                record.ended_at = Some(Utc::now());
                self.shared
                    .kv
                    .put(&keys::task_key(&self.orch.id, task_id), record)
                    .await?;
            }
        }

        for task in self.tasks.values() {
            if task.status == TaskStatus::Completed {
                if let Some(output) = &task.output {
                    self.outputs.insert(task.task_id.clone(), output.clone());
                }
            }
        }
        Ok(())
    }

    /// Redispatch every task that was in flight when the engine stopped,
    /// under the same idempotency key and a fresh execution id.
    async fn redispatch_inflight(&mut self) -> Result<()> {
        let inflight: Vec<String> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Dispatched | TaskStatus::InProgress))
            .map(|t| t.task_id.clone())
            .collect();
        for task_id in inflight {
            tracing::info!(
                target: "orra.core",
                orchestration_id = %self.orch.id,
                task_id = %task_id,
                "redispatching in-flight task after restart"
            );
            self.dispatch_task(&task_id).await?;
        }
        Ok(())
    }

    // ---- execution loop --------------------------------------------------

    async fn execute(&mut self) -> Result<()> {
        let mut connectivity = self.shared.events.connectivity();
        loop {
            if self.shared.shutdown.is_cancelled() {
                return Ok(());
            }

            if let Some(fail) = self.sync_health().await? {
                return self.fail(fail).await;
            }

            if self.orch.status == OrchestrationStatus::Processing {
                if let Some(fail) = self.dispatch_ready().await? {
                    return self.fail(fail).await;
                }
            }

            if TaskScheduler::all_completed(&self.tasks) {
                return self.complete().await;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return Ok(()),
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if let Some(fail) = self.handle_message(msg).await? {
                        return self.fail(fail).await;
                    }
                }
                changed = connectivity.changed() => {
                    // Connection churn; the loop re-evaluates service health
                    // and drains any queue that just became sendable.
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if let Some(fail) = self.check_timeouts().await? {
                        return self.fail(fail).await;
                    }
                }
            }
        }
    }

    /// Pause while any waited-on service is offline, resume once every one is
    /// back, fail once the grace period runs out. Task timers freeze per task
    /// while the owning service is down; thawing credits the offline interval
    /// back, capped at twice the configured timeout.
    async fn sync_health(&mut self) -> Result<Option<FailContext>> {
        let waiting = TaskScheduler::waiting_services(&self.tasks, &self.deps);
        let mut any_offline = false;
        let mut offline: BTreeSet<String> = BTreeSet::new();
        for service_id in &waiting {
            if !self.shared.connections.is_connected(service_id).await {
                any_offline = true;
                offline.insert(service_id.clone());
            }
        }

        // Per-task timer freeze/thaw.
        let now = Instant::now();
        for (task_id, timer) in self.timers.iter_mut() {
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            let task_offline = offline.contains(&task.service_id);
            match (task_offline, timer.frozen_remaining) {
                (true, None) => {
                    timer.frozen_remaining =
                        Some(timer.deadline.saturating_duration_since(now));
                }
                (false, Some(remaining)) => {
                    timer.deadline = (now + remaining).min(timer.hard_deadline);
                    timer.frozen_remaining = None;
                }
                _ => {}
            }
        }

        match (any_offline, self.orch.status) {
            (true, OrchestrationStatus::Processing) => {
                self.paused_since = Some(now);
                self.set_status(OrchestrationStatus::Paused).await?;
            }
            (false, OrchestrationStatus::Paused) => {
                self.paused_since = None;
                self.set_status(OrchestrationStatus::Processing).await?;
            }
            (true, OrchestrationStatus::Paused) => {
                // A driver resumed from a restart re-enters paused without a
                // pause instant; the grace window restarts here.
                let since = *self.paused_since.get_or_insert(now);
                let grace = Duration::from_millis(self.orch.health_grace_period_ms);
                let expired = since.elapsed() >= grace;
                if expired {
                    let services: Vec<String> = offline.into_iter().collect();
                    tracing::warn!(
                        target: "orra.core",
                        orchestration_id = %self.orch.id,
                        services = ?services,
                        "health grace period expired"
                    );
                    let task_id = self.fail_waiting_tasks(&services).await?;
                    return Ok(Some(FailContext {
                        task_id,
                        error: json!({
                            "error": "service connection lost beyond the health grace period",
                            "services": services,
                        }),
                        reason: CompensationReason::OrchestrationFailed,
                        abort_payload: None,
                    }));
                }
            }
            _ => {}
        }
        Ok(None)
    }

    /// Mark every task stranded on a dead service failed; returns the first
    /// affected task id.
    async fn fail_waiting_tasks(&mut self, services: &[String]) -> Result<String> {
        let mut affected: Vec<String> = self
            .tasks
            .values()
            .filter(|t| !t.status.is_execution_terminal())
            .filter(|t| services.contains(&t.service_id))
            .map(|t| t.task_id.clone())
            .collect();
        affected.sort();
        for task_id in &affected {
            self.mark_task_failed(task_id, "service connection lost beyond the health grace period")
                .await?;
        }
        Ok(affected.first().cloned().unwrap_or_default())
    }

    async fn dispatch_ready(&mut self) -> Result<Option<FailContext>> {
        for task_id in TaskScheduler::ready_tasks(&self.tasks, &self.deps) {
            if let Some(fail) = self.dispatch_task(&task_id).await? {
                return Ok(Some(fail));
            }
        }
        Ok(None)
    }

    async fn dispatch_task(&mut self, task_id: &str) -> Result<Option<FailContext>> {
        let template = self
            .inputs
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        let resolved = match resolve_input(&template, &self.outputs) {
            Ok(value) => value,
            Err(err) => {
                self.mark_task_failed(task_id, &err.to_string()).await?;
                return Ok(Some(FailContext {
                    task_id: task_id.to_string(),
                    error: json!({"error": err.to_string()}),
                    reason: CompensationReason::OrchestrationFailed,
                    abort_payload: None,
                }));
            }
        };

        let execution_id = new_execution_id();
        let (service_id, idempotency_key) = {
            let task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| OrraError::Internal(format!("unknown task {task_id}")))?;
            task.execution_id = execution_id.clone();
            task.status = TaskStatus::Dispatched;
            task.input = Some(resolved.clone());
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            (task.service_id.clone(), task.idempotency_key.clone())
        };
        let task_snapshot = self.tasks[task_id].clone();
        self.save_task(&task_snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskDispatched,
                task_id,
                json!({"executionId": execution_id, "input": resolved}),
            )
            .await?;
        self.emit_task_event(task_id, TaskStatus::Dispatched);

        let timeout = Duration::from_millis(self.orch.timeout_ms);
        let now = Instant::now();
        self.timers.insert(
            task_id.to_string(),
            TaskTimer {
                deadline: now + timeout,
                hard_deadline: now + timeout * 2,
                frozen_remaining: None,
            },
        );

        let request = EngineMessage::TaskRequest(TaskRequest {
            orchestration_id: self.orch.id.clone(),
            task_id: task_id.to_string(),
            execution_id,
            idempotency_key,
            service_id: service_id.clone(),
            input: resolved,
        });
        let outcome = self
            .shared
            .connections
            .send(&self.orch.project_id, &service_id, request)
            .await;
        match outcome {
            SendOutcome::Sent | SendOutcome::Queued => {}
            SendOutcome::QueueFull => {
                // Backpressure: requests are never dropped. Put the task back
                // and let the pause/resume machinery retry after the queue
                // drains on reconnect.
                tracing::warn!(
                    target: "orra.core",
                    orchestration_id = %self.orch.id,
                    task_id,
                    service_id = %service_id,
                    "send queue full; deferring dispatch"
                );
                self.timers.remove(task_id);
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Pending;
                }
                let task_snapshot = self.tasks[task_id].clone();
                self.save_task(&task_snapshot).await?;
            }
            SendOutcome::Dropped => {
                return Err(OrraError::Internal(
                    "task request classified as non-queueable".into(),
                ));
            }
        }
        Ok(None)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        if self.orch.status == OrchestrationStatus::Paused {
            if let Some(since) = self.paused_since {
                let grace = Duration::from_millis(self.orch.health_grace_period_ms);
                next = Some(since + grace);
            }
        }
        for (task_id, timer) in &self.timers {
            let running = self
                .tasks
                .get(task_id)
                .map(|t| !t.status.is_execution_terminal())
                .unwrap_or(false);
            if !running || timer.frozen_remaining.is_some() {
                continue;
            }
            let effective = timer.deadline.min(timer.hard_deadline);
            next = Some(next.map_or(effective, |n| n.min(effective)));
        }
        next
    }

    async fn check_timeouts(&mut self) -> Result<Option<FailContext>> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .timers
            .iter()
            .filter(|(task_id, timer)| {
                timer.frozen_remaining.is_none()
                    && timer.deadline.min(timer.hard_deadline) <= now
                    && self
                        .tasks
                        .get(*task_id)
                        .map(|t| !t.status.is_execution_terminal())
                        .unwrap_or(false)
            })
            .map(|(task_id, _)| task_id.clone())
            .collect();
        expired.sort();
        let Some(task_id) = expired.first().cloned() else {
            return Ok(None);
        };
        self.mark_task_failed(&task_id, "timeout").await?;
        Ok(Some(FailContext {
            task_id: task_id.clone(),
            error: json!({"error": "timeout"}),
            reason: CompensationReason::OrchestrationFailed,
            abort_payload: None,
        }))
    }

    // ---- inbound messages ------------------------------------------------

    async fn handle_message(&mut self, msg: ServiceMessage) -> Result<Option<FailContext>> {
        match msg {
            ServiceMessage::TaskAbortResult(result) => self.on_abort(result).await,
            ServiceMessage::TaskResult(result) => {
                if result.abort_payload.is_some() {
                    // Compatibility ingress: abort smuggled through task_result.
                    self.on_abort(result).await
                } else if result.error.is_some() {
                    self.on_failure(result).await
                } else {
                    self.on_completion(result).await
                }
            }
            ServiceMessage::TaskInterimResult(interim) => {
                self.on_interim(interim).await?;
                Ok(None)
            }
            ServiceMessage::TaskStatus(update) => {
                self.on_status(update).await?;
                Ok(None)
            }
            ServiceMessage::Pong { .. } => Ok(None),
        }
    }

    /// Locate the task a result belongs to. Matching is by idempotency key,
    /// so results from superseded execution ids still land.
    fn match_task(&self, idempotency_key: &str, task_id: &str) -> Option<String> {
        self.tasks
            .values()
            .find(|t| t.idempotency_key == idempotency_key)
            .or_else(|| self.tasks.get(task_id))
            .map(|t| t.task_id.clone())
    }

    async fn on_completion(&mut self, result: TaskResult) -> Result<Option<FailContext>> {
        let Some(task_id) = self.match_task(&result.idempotency_key, &result.task_id) else {
            return Ok(None);
        };
        if self.tasks[&task_id].status.is_execution_terminal() {
            tracing::debug!(
                target: "orra.core",
                orchestration_id = %self.orch.id,
                task_id = %task_id,
                "duplicate task result ignored"
            );
            return Ok(None);
        }
        let output = result.result.clone().unwrap_or(Value::Null);
        {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return Ok(None);
            };
            task.status = TaskStatus::Completed;
            task.output = Some(output.clone());
            task.ended_at = Some(Utc::now());
        }
        let snapshot = self.tasks[&task_id].clone();
        self.save_task(&snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskCompleted,
                &task_id,
                json!({"result": output, "executionId": result.execution_id}),
            )
            .await?;
        self.emit_task_event(&task_id, TaskStatus::Completed);
        self.outputs.insert(task_id.clone(), output);
        self.timers.remove(&task_id);
        self.schedule_compensation_if_revertible(&task_id).await?;
        Ok(None)
    }

    /// A completed task on a revertible service owes a compensation record,
    /// created eagerly so a later failure can find it.
    async fn schedule_compensation_if_revertible(&mut self, task_id: &str) -> Result<()> {
        let task = &self.tasks[task_id];
        let Some(service) = self.catalog.get(&task.service_id) else {
            return Ok(());
        };
        if !service.revertible {
            return Ok(());
        }
        let Some(revert_ttl_ms) = service.revert_ttl_ms else {
            return Ok(());
        };
        let now = Utc::now();
        let record = CompensationRecord {
            id: new_compensation_id(),
            task_id: task.task_id.clone(),
            orchestration_id: self.orch.id.clone(),
            service_id: task.service_id.clone(),
            service_name: task.service_name.clone(),
            original_task_input: task.input.clone().unwrap_or(Value::Null),
            original_task_result: task.output.clone().unwrap_or(Value::Null),
            original_completed_at: task.ended_at.unwrap_or(now),
            ttl_deadline: now + chrono::Duration::milliseconds(revert_ttl_ms as i64),
            attempts: 0,
            max_attempts: self.shared.config.compensation_max_attempts,
            status: CompensationStatus::Pending,
            context: None,
            failure: None,
            partial: None,
            resolution_state: ResolutionState::Pending,
            resolution_reason: None,
            resolution_timestamp: None,
            created_at: now,
        };
        self.shared
            .kv
            .put(&keys::compensation_key(&self.orch.id, &record.id), &record)
            .await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::CompensationScheduled,
                task_id,
                json!({"compensationId": record.id}),
            )
            .await?;
        self.refresh_compensation_summary().await?;
        Ok(())
    }

    async fn on_failure(&mut self, result: TaskResult) -> Result<Option<FailContext>> {
        let Some(task_id) = self.match_task(&result.idempotency_key, &result.task_id) else {
            return Ok(None);
        };
        if self.tasks[&task_id].status.is_execution_terminal() {
            return Ok(None);
        }
        let error = result.error.clone().unwrap_or_else(|| "task failed".into());
        self.mark_task_failed(&task_id, &error).await?;
        Ok(Some(FailContext {
            task_id,
            error: json!({"error": error}),
            reason: CompensationReason::OrchestrationFailed,
            abort_payload: None,
        }))
    }

    async fn on_abort(&mut self, result: TaskResult) -> Result<Option<FailContext>> {
        let Some(task_id) = self.match_task(&result.idempotency_key, &result.task_id) else {
            return Ok(None);
        };
        if self.tasks[&task_id].status.is_execution_terminal() {
            return Ok(None);
        }
        let payload = result.abort_payload.clone().unwrap_or(Value::Null);
        {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return Ok(None);
            };
            task.status = TaskStatus::Aborted;
            task.abort_payload = Some(payload.clone());
            task.ended_at = Some(Utc::now());
        }
        let snapshot = self.tasks[&task_id].clone();
        self.save_task(&snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskAborted,
                &task_id,
                json!({"abortPayload": payload, "executionId": result.execution_id}),
            )
            .await?;
        self.emit_task_event(&task_id, TaskStatus::Aborted);
        self.timers.remove(&task_id);
        Ok(Some(FailContext {
            task_id,
            error: json!({"error": "task aborted", "abortPayload": payload}),
            reason: CompensationReason::Aborted,
            abort_payload: Some(payload),
        }))
    }

    async fn on_interim(&mut self, interim: TaskInterim) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&interim.task_id) else {
            return Ok(());
        };
        if task.status.is_execution_terminal() {
            return Ok(());
        }
        task.interim_updates.push(InterimUpdate {
            received_at: Utc::now(),
            payload: interim.payload.clone(),
        });
        let snapshot = task.clone();
        self.save_task(&snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskInterim,
                &interim.task_id,
                json!({"payload": interim.payload}),
            )
            .await?;
        Ok(())
    }

    /// `task_status:in_progress` is informational and never resets timers.
    async fn on_status(&mut self, update: TaskStatusUpdate) -> Result<()> {
        let Some(task_id) = self.match_task(&update.idempotency_key, &update.task_id) else {
            return Ok(());
        };
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Dispatched {
            return Ok(());
        }
        task.status = TaskStatus::InProgress;
        let snapshot = task.clone();
        self.save_task(&snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskStatus,
                &task_id,
                json!({"status": update.status}),
            )
            .await?;
        self.emit_task_event(&task_id, TaskStatus::InProgress);
        Ok(())
    }

    // ---- terminal resolution --------------------------------------------

    async fn complete(&mut self) -> Result<()> {
        // The final result aggregates the outputs of leaf tasks: tasks no
        // other task draws values from.
        let referenced: BTreeSet<&String> = self.deps.values().flatten().collect();
        let mut results = Map::new();
        for task in self.tasks.values() {
            if !referenced.contains(&task.task_id) {
                results.insert(
                    task.task_id.clone(),
                    task.output.clone().unwrap_or(Value::Null),
                );
            }
        }
        self.orch.results = Some(Value::Object(results));
        self.set_status(OrchestrationStatus::Completed).await?;

        let payload = json!({
            "status": "completed",
            "results": self.orch.results,
        });
        self.notify_webhooks(orra_wire::EVENT_ORCHESTRATION_COMPLETED, payload)
            .await?;
        tracing::info!(
            target: "orra.core",
            orchestration_id = %self.orch.id,
            "orchestration completed"
        );
        Ok(())
    }

    async fn fail(&mut self, context: FailContext) -> Result<()> {
        self.orch.error = Some(json!({
            "taskId": context.task_id,
            "error": context.error,
            "reason": context.reason,
            "abortPayload": context.abort_payload,
        }));
        self.set_status(OrchestrationStatus::Failed).await?;

        // The failure webhook is not held for compensation.
        let payload = json!({
            "status": "failed",
            "taskId": context.task_id,
            "error": context.error,
        });
        self.notify_webhooks(orra_wire::EVENT_ORCHESTRATION_FAILED, payload)
            .await?;
        tracing::info!(
            target: "orra.core",
            orchestration_id = %self.orch.id,
            task_id = %context.task_id,
            "orchestration failed; starting compensation"
        );

        compensation::run_pending(
            &self.shared,
            &mut self.orch,
            context.reason,
            context.abort_payload,
            &mut self.rx,
        )
        .await
    }

    /// After a restart of an already-failed orchestration: finish the revert
    /// cascade using the recorded failure context.
    async fn resume_compensation(&mut self) -> Result<()> {
        let (reason, payload) = self
            .orch
            .error
            .as_ref()
            .map(|error| {
                let reason = serde_json::from_value::<CompensationReason>(error["reason"].clone())
                    .unwrap_or(CompensationReason::OrchestrationFailed);
                let payload = match &error["abortPayload"] {
                    Value::Null => None,
                    value => Some(value.clone()),
                };
                (reason, payload)
            })
            .unwrap_or((CompensationReason::OrchestrationFailed, None));
        compensation::run_pending(&self.shared, &mut self.orch, reason, payload, &mut self.rx)
            .await
    }

    async fn not_actionable(&mut self, reason: String) -> Result<()> {
        self.orch.error = Some(json!({"error": reason}));
        self.set_status(OrchestrationStatus::NotActionable).await?;
        let payload = json!({
            "status": "not_actionable",
            "error": reason,
        });
        self.notify_webhooks(orra_wire::EVENT_ORCHESTRATION_FAILED, payload)
            .await?;
        tracing::info!(
            target: "orra.core",
            orchestration_id = %self.orch.id,
            "orchestration is not actionable"
        );
        Ok(())
    }

    // ---- shared plumbing -------------------------------------------------

    async fn mark_task_failed(&mut self, task_id: &str, error: &str) -> Result<()> {
        {
            let Some(task) = self.tasks.get_mut(task_id) else {
                return Ok(());
            };
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.ended_at = Some(Utc::now());
        }
        let snapshot = self.tasks[task_id].clone();
        self.save_task(&snapshot).await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::TaskFailed,
                task_id,
                json!({"error": error}),
            )
            .await?;
        self.emit_task_event(task_id, TaskStatus::Failed);
        self.timers.remove(task_id);
        Ok(())
    }

    async fn set_status(&mut self, status: OrchestrationStatus) -> Result<()> {
        if self.orch.status == status {
            return Ok(());
        }
        self.orch.status = status;
        self.persist_orchestration().await?;
        self.shared
            .log
            .append(
                &self.orch.id,
                LogEntryKind::OrchestrationStatus,
                "",
                json!({"status": status}),
            )
            .await?;
        self.shared
            .events
            .emit(EngineEvent::OrchestrationStatusChanged {
                orchestration_id: self.orch.id.clone(),
                project_id: self.orch.project_id.clone(),
                status,
            });
        Ok(())
    }

    async fn persist_orchestration(&self) -> Result<()> {
        self.shared
            .kv
            .put(
                &keys::orchestration_key(&self.orch.project_id, &self.orch.id),
                &self.orch,
            )
            .await
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<()> {
        self.shared
            .kv
            .put(&keys::task_key(&self.orch.id, &task.task_id), task)
            .await
    }

    async fn refresh_compensation_summary(&mut self) -> Result<()> {
        let records: Vec<(String, CompensationRecord)> = self
            .shared
            .kv
            .list_prefix(&keys::compensation_prefix(&self.orch.id))
            .await?;
        self.orch.compensation =
            CompensationSummary::from_records(records.iter().map(|(_, r)| r));
        self.persist_orchestration().await
    }

    fn emit_task_event(&self, task_id: &str, status: TaskStatus) {
        self.shared.events.emit(EngineEvent::TaskStatusChanged {
            orchestration_id: self.orch.id.clone(),
            task_id: task_id.to_string(),
            status,
        });
    }

    async fn notify_webhooks(&self, event_type: &str, payload: Value) -> Result<()> {
        let project = self.shared.projects.get(&self.orch.project_id).await?;
        let mut targets: Vec<&str> = Vec::new();
        if !self.orch.webhook_url.is_empty() {
            targets.push(self.orch.webhook_url.as_str());
        }
        for url in &project.webhooks {
            if !targets.contains(&url.as_str()) {
                targets.push(url.as_str());
            }
        }
        for url in targets {
            self.shared.webhooks.notify(
                url,
                event_type,
                &self.orch.id,
                &self.orch.project_id,
                payload.clone(),
            );
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Substitute every reference expression in a task input template against the
/// available outputs (Task Zero plus completed tasks).
pub(crate) fn resolve_input(
    template: &Map<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Value> {
    let mut resolved = Map::new();
    for (field, value) in template {
        resolved.insert(field.clone(), resolve_value(value, outputs)?);
    }
    Ok(Value::Object(resolved))
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(text) => match parse_reference(text)? {
            Some(reference) => {
                let mut current = outputs.get(&reference.task_id).ok_or_else(|| {
                    OrraError::validation(format!(
                        "reference {text:?} points at a task with no output"
                    ))
                })?;
                for segment in &reference.path {
                    current = current.get(segment).ok_or_else(|| {
                        OrraError::validation(format!(
                            "reference {text:?} does not resolve: missing field {segment:?}"
                        ))
                    })?;
                }
                Ok(current.clone())
            }
            None => Ok(value.clone()),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, outputs)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(item, outputs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_references_through_outputs() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "task0".to_string(),
            json!({"productId": "PROD-2", "qty": 3}),
        );
        outputs.insert(
            "task1".to_string(),
            json!({"reservation": {"id": "R1"}}),
        );
        let template: Map<String, Value> = serde_json::from_value(json!({
            "productId": "$task0.productId",
            "reservationId": "$task1.reservation.id",
            "note": "literal",
            "nested": {"qty": "$task0.qty"},
            "list": ["$task0.productId", 7]
        }))
        .unwrap();
        let resolved = resolve_input(&template, &outputs).unwrap();
        assert_eq!(resolved["productId"], "PROD-2");
        assert_eq!(resolved["reservationId"], "R1");
        assert_eq!(resolved["note"], "literal");
        assert_eq!(resolved["nested"]["qty"], 3);
        assert_eq!(resolved["list"][0], "PROD-2");
        assert_eq!(resolved["list"][1], 7);
    }

    #[test]
    fn missing_reference_field_errors() {
        let mut outputs = HashMap::new();
        outputs.insert("task0".to_string(), json!({"productId": "PROD-1"}));
        let template: Map<String, Value> =
            serde_json::from_value(json!({"x": "$task0.missing"})).unwrap();
        assert!(resolve_input(&template, &outputs).is_err());
    }

    #[test]
    fn unresolved_task_errors() {
        let outputs = HashMap::new();
        let template: Map<String, Value> =
            serde_json::from_value(json!({"x": "$task9.value"})).unwrap();
        assert!(resolve_input(&template, &outputs).is_err());
    }
}
