use std::collections::{BTreeSet, HashMap};

use orra_types::{TaskRecord, TaskStatus};

/// Pure scheduling decisions over the task set. Readiness comes from the
/// dependency sets derived from reference expressions; the plan's
/// `parallel_groups` layering is advisory metadata and never consulted.
pub struct TaskScheduler;

impl TaskScheduler {
    /// Tasks whose dependencies are all completed and which have not been
    /// dispatched yet, in `task_id` order so replays are deterministic.
    pub fn ready_tasks(
        tasks: &HashMap<String, TaskRecord>,
        deps: &HashMap<String, BTreeSet<String>>,
    ) -> Vec<String> {
        let mut ready: Vec<String> = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                deps.get(&task.task_id)
                    .map(|set| {
                        set.iter().all(|dep| {
                            tasks
                                .get(dep)
                                .map(|d| d.status == TaskStatus::Completed)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(true)
            })
            .map(|task| task.task_id.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn all_completed(tasks: &HashMap<String, TaskRecord>) -> bool {
        tasks
            .values()
            .all(|task| task.status == TaskStatus::Completed)
    }

    pub fn any_failed(tasks: &HashMap<String, TaskRecord>) -> bool {
        tasks
            .values()
            .any(|task| matches!(task.status, TaskStatus::Failed | TaskStatus::Aborted))
    }

    /// Service ids the orchestration is currently waiting on: owners of
    /// dispatched or in-progress tasks, plus owners of ready tasks.
    pub fn waiting_services(
        tasks: &HashMap<String, TaskRecord>,
        deps: &HashMap<String, BTreeSet<String>>,
    ) -> BTreeSet<String> {
        let mut services: BTreeSet<String> = tasks
            .values()
            .filter(|task| {
                matches!(task.status, TaskStatus::Dispatched | TaskStatus::InProgress)
            })
            .map(|task| task.service_id.clone())
            .collect();
        for task_id in Self::ready_tasks(tasks, deps) {
            if let Some(task) = tasks.get(&task_id) {
                services.insert(task.service_id.clone());
            }
        }
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, service: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            orchestration_id: "o_1".into(),
            service_id: service.to_string(),
            service_name: service.to_string(),
            service_version: 1,
            idempotency_key: format!("k-{id}"),
            execution_id: format!("exec-{id}"),
            status,
            input: None,
            output: None,
            error: None,
            abort_payload: None,
            interim_updates: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    fn fixture(
        specs: &[(&str, &str, TaskStatus, &[&str])],
    ) -> (HashMap<String, TaskRecord>, HashMap<String, BTreeSet<String>>) {
        let mut tasks = HashMap::new();
        let mut deps = HashMap::new();
        for (id, service, status, dep_ids) in specs {
            tasks.insert(id.to_string(), task(id, service, *status));
            deps.insert(
                id.to_string(),
                dep_ids.iter().map(|d| d.to_string()).collect(),
            );
        }
        (tasks, deps)
    }

    #[test]
    fn readiness_follows_dependencies() {
        let (tasks, deps) = fixture(&[
            ("task1", "svc_a", TaskStatus::Completed, &[]),
            ("task2", "svc_b", TaskStatus::Pending, &["task1"]),
            ("task3", "svc_c", TaskStatus::Pending, &["task2"]),
        ]);
        assert_eq!(TaskScheduler::ready_tasks(&tasks, &deps), vec!["task2"]);
    }

    #[test]
    fn ready_set_is_lexicographically_ordered() {
        let (tasks, deps) = fixture(&[
            ("task3", "svc_a", TaskStatus::Pending, &[]),
            ("task1", "svc_b", TaskStatus::Pending, &[]),
            ("task2", "svc_c", TaskStatus::Pending, &[]),
        ]);
        assert_eq!(
            TaskScheduler::ready_tasks(&tasks, &deps),
            vec!["task1", "task2", "task3"]
        );
    }

    #[test]
    fn waiting_services_cover_ready_and_inflight() {
        let (tasks, deps) = fixture(&[
            ("task1", "svc_a", TaskStatus::Dispatched, &[]),
            ("task2", "svc_b", TaskStatus::Pending, &[]),
            ("task3", "svc_c", TaskStatus::Pending, &["task1"]),
        ]);
        let waiting = TaskScheduler::waiting_services(&tasks, &deps);
        assert!(waiting.contains("svc_a"));
        assert!(waiting.contains("svc_b"));
        assert!(!waiting.contains("svc_c"));
    }

    #[test]
    fn completion_and_failure_checks() {
        let (tasks, _) = fixture(&[
            ("task1", "svc_a", TaskStatus::Completed, &[]),
            ("task2", "svc_b", TaskStatus::Completed, &[]),
        ]);
        assert!(TaskScheduler::all_completed(&tasks));
        let (tasks, _) = fixture(&[
            ("task1", "svc_a", TaskStatus::Completed, &[]),
            ("task2", "svc_b", TaskStatus::Aborted, &[]),
        ]);
        assert!(!TaskScheduler::all_completed(&tasks));
        assert!(TaskScheduler::any_failed(&tasks));
    }
}
