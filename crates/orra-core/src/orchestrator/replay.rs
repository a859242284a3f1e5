use std::collections::BTreeMap;

use serde_json::Value;

use orra_types::{CompensationStatus, LogEntry, LogEntryKind, OrchestrationStatus, TaskStatus};

/// Task state as reconstructed from the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedTask {
    pub status: TaskStatus,
    pub execution_id: Option<String>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub abort_payload: Option<Value>,
    pub interim_count: usize,
}

impl Default for FoldedTask {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            execution_id: None,
            output: None,
            error: None,
            abort_payload: None,
            interim_count: 0,
        }
    }
}

/// Orchestration state reconstructed from the log. The fold is pure: folding
/// the same entries any number of times yields identical state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayState {
    pub orchestration_status: Option<OrchestrationStatus>,
    pub tasks: BTreeMap<String, FoldedTask>,
    pub compensations: BTreeMap<String, CompensationStatus>,
}

pub fn fold_log(entries: &[LogEntry]) -> ReplayState {
    let mut state = ReplayState::default();
    for entry in entries {
        match entry.kind {
            LogEntryKind::OrchestrationStarted => {}
            LogEntryKind::OrchestrationStatus => {
                if let Ok(status) =
                    serde_json::from_value::<OrchestrationStatus>(entry.payload["status"].clone())
                {
                    state.orchestration_status = Some(status);
                }
            }
            LogEntryKind::TaskDispatched => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                // Terminal outcomes are immutable; a late dispatch entry from
                // a redispatch race must not reopen the task.
                if !task.status.is_execution_terminal() {
                    task.status = TaskStatus::Dispatched;
                    task.execution_id = entry.payload["executionId"]
                        .as_str()
                        .map(str::to_string);
                }
            }
            LogEntryKind::TaskStatus => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                if task.status == TaskStatus::Dispatched {
                    task.status = TaskStatus::InProgress;
                }
            }
            LogEntryKind::TaskInterim => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                task.interim_count += 1;
            }
            LogEntryKind::TaskCompleted => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                if !task.status.is_execution_terminal() {
                    task.status = TaskStatus::Completed;
                    task.output = Some(entry.payload["result"].clone());
                }
            }
            LogEntryKind::TaskFailed => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                if !task.status.is_execution_terminal() {
                    task.status = TaskStatus::Failed;
                    task.error = entry.payload["error"].as_str().map(str::to_string);
                }
            }
            LogEntryKind::TaskAborted => {
                let task = state.tasks.entry(entry.task_id.clone()).or_default();
                if !task.status.is_execution_terminal() {
                    task.status = TaskStatus::Aborted;
                    task.abort_payload = Some(entry.payload["abortPayload"].clone());
                }
            }
            LogEntryKind::CompensationScheduled => {
                if let Some(id) = entry.payload["compensationId"].as_str() {
                    state
                        .compensations
                        .entry(id.to_string())
                        .or_insert(CompensationStatus::Pending);
                }
            }
            LogEntryKind::CompensationDispatched | LogEntryKind::CompensationAttempted => {
                if let Some(id) = entry.payload["compensationId"].as_str() {
                    let status = state
                        .compensations
                        .entry(id.to_string())
                        .or_insert(CompensationStatus::Processing);
                    if !status.is_terminal() {
                        *status = CompensationStatus::Processing;
                    }
                }
            }
            LogEntryKind::CompensationCompleted
            | LogEntryKind::CompensationPartial
            | LogEntryKind::CompensationFailed
            | LogEntryKind::CompensationExpired => {
                if let Some(id) = entry.payload["compensationId"].as_str() {
                    let terminal = match entry.kind {
                        LogEntryKind::CompensationCompleted => CompensationStatus::Completed,
                        LogEntryKind::CompensationPartial => CompensationStatus::Partial,
                        LogEntryKind::CompensationFailed => CompensationStatus::Failed,
                        _ => CompensationStatus::Expired,
                    };
                    let status = state
                        .compensations
                        .entry(id.to_string())
                        .or_insert(terminal);
                    if !status.is_terminal() {
                        *status = terminal;
                    }
                }
            }
        }
    }
    state
}
