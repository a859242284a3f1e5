use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use orra_store::{keys, KvStore};
use orra_types::{
    new_execution_id, CompensationContext, CompensationReason, CompensationRecord,
    CompensationStatus, CompensationSummary, EngineEvent, LogEntryKind, Orchestration, OrraError,
    ResolutionState, Result, TaskStatus,
};
use orra_wire::{CompensationInput, CompensationRequest, EngineMessage, ServiceMessage, TaskResult, TaskResultStatus};

use crate::orchestrator::{compensation_idempotency_key, Shared};

/// Attempt `n` sleeps `min(30s, 1s * 2^(n-1))` before the next try.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(5);
    Duration::from_secs(1 << shift).min(Duration::from_secs(30))
}

/// Run the revert cascade for a failed orchestration: every pending record,
/// newest original completion first, strictly one at a time. Pending records
/// whose TTL already passed are expired up front.
pub(crate) async fn run_pending(
    shared: &Arc<Shared>,
    orch: &mut Orchestration,
    reason: CompensationReason,
    payload: Option<Value>,
    rx: &mut mpsc::UnboundedReceiver<ServiceMessage>,
) -> Result<()> {
    let entries: Vec<(String, CompensationRecord)> = shared
        .kv
        .list_prefix(&keys::compensation_prefix(&orch.id))
        .await?;
    let mut pending: Vec<CompensationRecord> = entries
        .into_iter()
        .map(|(_, record)| record)
        .filter(|record| {
            matches!(
                record.status,
                CompensationStatus::Pending | CompensationStatus::Processing
            )
        })
        .collect();
    // Newest-first to preserve cascade semantics.
    pending.sort_by(|a, b| b.original_completed_at.cmp(&a.original_completed_at));

    let context = CompensationContext {
        reason,
        orchestration_id: orch.id.clone(),
        timestamp: Utc::now(),
        payload,
    };

    for mut record in pending {
        let terminal = if Utc::now() >= record.ttl_deadline {
            CompensationStatus::Expired
        } else {
            process_record(shared, orch, &mut record, &context, rx).await?
        };
        finish_record(shared, orch, &mut record, terminal).await?;
    }
    Ok(())
}

/// Drive one compensation record to a terminal status.
async fn process_record(
    shared: &Arc<Shared>,
    orch: &Orchestration,
    record: &mut CompensationRecord,
    context: &CompensationContext,
    rx: &mut mpsc::UnboundedReceiver<ServiceMessage>,
) -> Result<CompensationStatus> {
    record.status = CompensationStatus::Processing;
    record.context = Some(context.clone());
    save_record(&shared.kv, record).await?;
    set_task_status(shared, orch, &record.task_id, TaskStatus::Compensating).await?;

    let idempotency_key = compensation_idempotency_key(&orch.id, &record.task_id);
    let attempt_budget = Duration::from_millis(shared.config.compensation_attempt_budget_ms);

    loop {
        if Utc::now() >= record.ttl_deadline {
            return Ok(CompensationStatus::Expired);
        }
        if record.attempts >= record.max_attempts {
            return Ok(CompensationStatus::Failed);
        }
        record.attempts += 1;
        let attempt = record.attempts;
        save_record(&shared.kv, record).await?;

        let execution_id = new_execution_id();
        let request = EngineMessage::CompensationRequest(CompensationRequest {
            orchestration_id: orch.id.clone(),
            task_id: record.task_id.clone(),
            compensation_id: record.id.clone(),
            execution_id,
            idempotency_key: idempotency_key.clone(),
            service_id: record.service_id.clone(),
            input: CompensationInput {
                original_task: json!({
                    "taskId": record.task_id,
                    "serviceName": record.service_name,
                    "input": record.original_task_input,
                }),
                task_result: record.original_task_result.clone(),
            },
            compensation_context: context.clone(),
        });
        shared
            .connections
            .send(&orch.project_id, &record.service_id, request)
            .await;
        shared
            .log
            .append(
                &orch.id,
                LogEntryKind::CompensationDispatched,
                &record.task_id,
                json!({"compensationId": record.id, "attempt": attempt}),
            )
            .await?;

        match await_result(rx, &idempotency_key, attempt_budget).await {
            Some(result) if result.status == Some(TaskResultStatus::Partial) => {
                record.partial = result.partial.clone();
                return Ok(CompensationStatus::Partial);
            }
            Some(result) if result.error.is_none() && result.abort_payload.is_none() => {
                return Ok(CompensationStatus::Completed);
            }
            Some(result) => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "compensation handler aborted".to_string());
                record.failure = Some(error.clone());
                shared
                    .log
                    .append(
                        &orch.id,
                        LogEntryKind::CompensationAttempted,
                        &record.task_id,
                        json!({"compensationId": record.id, "attempt": attempt, "error": error}),
                    )
                    .await?;
            }
            None => {
                record.failure = Some("attempt budget exceeded".to_string());
                shared
                    .log
                    .append(
                        &orch.id,
                        LogEntryKind::CompensationAttempted,
                        &record.task_id,
                        json!({
                            "compensationId": record.id,
                            "attempt": attempt,
                            "error": "attempt budget exceeded",
                        }),
                    )
                    .await?;
            }
        }
        save_record(&shared.kv, record).await?;
        if record.attempts < record.max_attempts {
            tokio::time::sleep(backoff_delay(record.attempts)).await;
        }
    }
}

/// Wait for the terminal reply matching one compensation dispatch. Interim
/// and status messages for the same key keep the wait alive; everything else
/// is ignored.
async fn await_result(
    rx: &mut mpsc::UnboundedReceiver<ServiceMessage>,
    idempotency_key: &str,
    budget: Duration,
) -> Option<TaskResult> {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(ServiceMessage::TaskResult(result)))
            | Ok(Some(ServiceMessage::TaskAbortResult(result)))
                if result.idempotency_key == idempotency_key =>
            {
                return Some(result);
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

async fn finish_record(
    shared: &Arc<Shared>,
    orch: &mut Orchestration,
    record: &mut CompensationRecord,
    terminal: CompensationStatus,
) -> Result<()> {
    record.status = terminal;
    save_record(&shared.kv, record).await?;

    let kind = match terminal {
        CompensationStatus::Completed => LogEntryKind::CompensationCompleted,
        CompensationStatus::Partial => LogEntryKind::CompensationPartial,
        CompensationStatus::Failed => LogEntryKind::CompensationFailed,
        CompensationStatus::Expired => LogEntryKind::CompensationExpired,
        other => {
            return Err(OrraError::Internal(format!(
                "compensation {} finished in non-terminal status {}",
                record.id,
                other.as_str()
            )));
        }
    };
    shared
        .log
        .append(
            &orch.id,
            kind,
            &record.task_id,
            json!({"compensationId": record.id}),
        )
        .await?;
    shared.events.emit(EngineEvent::CompensationStatusChanged {
        orchestration_id: orch.id.clone(),
        compensation_id: record.id.clone(),
        status: terminal,
    });

    let task_status = match terminal {
        CompensationStatus::Completed => TaskStatus::Compensated,
        CompensationStatus::Partial => TaskStatus::CompensationPartial,
        CompensationStatus::Failed => TaskStatus::CompensationFailed,
        _ => TaskStatus::CompensationExpired,
    };
    set_task_status(shared, orch, &record.task_id, task_status).await?;

    // Failed and expired reverts need an operator; partial is terminal but
    // not a failure, so no webhook fires for it.
    if matches!(
        terminal,
        CompensationStatus::Failed | CompensationStatus::Expired
    ) {
        let project = shared.projects.get(&orch.project_id).await?;
        for url in &project.compensation_failure_webhooks {
            shared.webhooks.notify(
                url,
                orra_wire::EVENT_COMPENSATION_FAILED,
                &orch.id,
                &orch.project_id,
                json!({
                    "compensationId": record.id,
                    "taskId": record.task_id,
                    "serviceName": record.service_name,
                    "status": terminal,
                    "failure": record.failure,
                    "attempts": record.attempts,
                }),
            );
        }
    }

    refresh_summary(shared, orch).await
}

async fn refresh_summary(shared: &Arc<Shared>, orch: &mut Orchestration) -> Result<()> {
    let records: Vec<(String, CompensationRecord)> = shared
        .kv
        .list_prefix(&keys::compensation_prefix(&orch.id))
        .await?;
    orch.compensation = CompensationSummary::from_records(records.iter().map(|(_, r)| r));
    shared
        .kv
        .put(&keys::orchestration_key(&orch.project_id, &orch.id), orch)
        .await
}

async fn set_task_status(
    shared: &Arc<Shared>,
    orch: &Orchestration,
    task_id: &str,
    status: TaskStatus,
) -> Result<()> {
    let key = keys::task_key(&orch.id, task_id);
    let Some(mut task) = shared.kv.get::<orra_types::TaskRecord>(&key).await? else {
        return Ok(());
    };
    task.status = status;
    shared.kv.put(&key, &task).await?;
    shared.events.emit(EngineEvent::TaskStatusChanged {
        orchestration_id: orch.id.clone(),
        task_id: task_id.to_string(),
        status,
    });
    Ok(())
}

async fn save_record(kv: &KvStore, record: &CompensationRecord) -> Result<()> {
    kv.put(
        &keys::compensation_key(&record.orchestration_id, &record.id),
        record,
    )
    .await
}

/// Operator-facing view over compensation records: the failed-compensation
/// registry and the resolve/ignore workflow.
#[derive(Clone)]
pub struct CompensationService {
    kv: KvStore,
}

impl CompensationService {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Records needing attention: failed, expired, plus terminal partials.
    pub async fn list_unresolved(
        &self,
        project_id: &str,
        status: Option<CompensationStatus>,
        resolution_state: Option<ResolutionState>,
    ) -> Result<Vec<CompensationRecord>> {
        let orchestrations: Vec<(String, Orchestration)> = self
            .kv
            .list_prefix(&keys::orchestration_prefix(project_id))
            .await?;
        let mut out = Vec::new();
        for (_, orchestration) in orchestrations {
            let records: Vec<(String, CompensationRecord)> = self
                .kv
                .list_prefix(&keys::compensation_prefix(&orchestration.id))
                .await?;
            for (_, record) in records {
                let surfaced = matches!(
                    record.status,
                    CompensationStatus::Failed
                        | CompensationStatus::Expired
                        | CompensationStatus::Partial
                );
                if !surfaced {
                    continue;
                }
                if let Some(filter) = status {
                    if record.status != filter {
                        continue;
                    }
                }
                if let Some(filter) = resolution_state {
                    if record.resolution_state != filter {
                        continue;
                    }
                }
                out.push(record);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub async fn get(&self, project_id: &str, compensation_id: &str) -> Result<CompensationRecord> {
        let records: Vec<(String, CompensationRecord)> =
            self.kv.list_prefix("compensation/").await?;
        for (_, record) in records {
            if record.id != compensation_id {
                continue;
            }
            let orchestration: Option<Orchestration> = self
                .kv
                .get(&keys::orchestration_key(project_id, &record.orchestration_id))
                .await?;
            if orchestration.is_some() {
                return Ok(record);
            }
        }
        Err(OrraError::NotFound(format!(
            "compensation {compensation_id}"
        )))
    }

    pub async fn resolve(
        &self,
        project_id: &str,
        compensation_id: &str,
        reason: &str,
    ) -> Result<CompensationRecord> {
        self.transition(project_id, compensation_id, ResolutionState::Resolved, reason)
            .await
    }

    pub async fn ignore(
        &self,
        project_id: &str,
        compensation_id: &str,
        reason: &str,
    ) -> Result<CompensationRecord> {
        self.transition(project_id, compensation_id, ResolutionState::Ignored, reason)
            .await
    }

    async fn transition(
        &self,
        project_id: &str,
        compensation_id: &str,
        state: ResolutionState,
        reason: &str,
    ) -> Result<CompensationRecord> {
        if reason.trim().is_empty() {
            return Err(OrraError::validation_param(
                "reason",
                "a resolution reason is required",
            ));
        }
        let mut record = self.get(project_id, compensation_id).await?;
        if !record.can_resolve() {
            return Err(OrraError::InvalidOperation(format!(
                "compensation {} is {} with resolution {:?} and cannot be resolved",
                record.id,
                record.status.as_str(),
                record.resolution_state,
            )));
        }
        record.resolution_state = state;
        record.resolution_reason = Some(reason.to_string());
        record.resolution_timestamp = Some(Utc::now());
        save_record(&self.kv, &record).await?;
        tracing::info!(
            target: "orra.comp",
            compensation_id = %record.id,
            state = ?state,
            "compensation resolved by operator"
        );
        Ok(record)
    }
}
