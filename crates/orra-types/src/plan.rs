use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{OrraError, Result};

/// The virtual first node carrying the action parameters and named literals.
pub const TASK_ZERO_ID: &str = "task0";

/// A generated execution plan: a DAG of tasks plus advisory layering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub parallel_groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    /// Service name this task runs against; empty for Task Zero.
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Frozen at preparation time; absent in templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<u64>,
}

/// A parsed `$taskId.path.to.field` reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub task_id: String,
    pub path: Vec<String>,
}

/// Parse a leaf value as a reference expression. Returns `Err` for composite
/// expressions (a `$` embedded in surrounding text), `Ok(None)` for plain
/// literals.
pub fn parse_reference(value: &str) -> Result<Option<Reference>> {
    if !value.contains('$') {
        return Ok(None);
    }
    let Some(rest) = value.strip_prefix('$') else {
        return Err(OrraError::validation(format!(
            "composite reference expression is not supported: {value:?}"
        )));
    };
    let mut parts = rest.split('.');
    let task_id = parts.next().unwrap_or_default();
    if task_id.is_empty() || task_id.contains(char::is_whitespace) || rest.contains('$') {
        return Err(OrraError::validation(format!(
            "malformed reference expression: {value:?}"
        )));
    }
    let path: Vec<String> = parts.map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(OrraError::validation(format!(
            "malformed reference expression: {value:?}"
        )));
    }
    Ok(Some(Reference {
        task_id: task_id.to_string(),
        path,
    }))
}

fn collect_references(value: &Value, out: &mut Vec<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(reference) = parse_reference(s)? {
                out.push(reference);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl PlanTask {
    pub fn is_task_zero(&self) -> bool {
        self.id == TASK_ZERO_ID
    }

    /// Every reference expression appearing in this task's input.
    pub fn references(&self) -> Result<Vec<Reference>> {
        let mut out = Vec::new();
        for value in self.input.values() {
            collect_references(value, &mut out)?;
        }
        Ok(out)
    }

    /// Distinct upstream task ids this task draws values from.
    pub fn dependencies(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .references()?
            .into_iter()
            .map(|r| r.task_id)
            .collect())
    }
}

impl Plan {
    pub fn task_zero(&self) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.is_task_zero())
    }

    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Executable tasks, i.e. everything except Task Zero.
    pub fn executable_tasks(&self) -> impl Iterator<Item = &PlanTask> {
        self.tasks.iter().filter(|t| !t.is_task_zero())
    }

    /// Dependency map for every executable task. Task Zero never counts as a
    /// dependency: its values are always available.
    pub fn dependency_map(&self) -> Result<HashMap<String, BTreeSet<String>>> {
        let mut map = HashMap::new();
        for task in self.executable_tasks() {
            let mut deps = task.dependencies()?;
            deps.remove(TASK_ZERO_ID);
            map.insert(task.id.clone(), deps);
        }
        Ok(map)
    }

    /// Structural validation: unique ids, Task Zero present, references
    /// resolve, graph acyclic.
    pub fn validate_structure(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(OrraError::validation("plan has no tasks"));
        }
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(OrraError::validation(format!(
                    "duplicate task id {:?}",
                    task.id
                )));
            }
        }
        if !ids.contains(TASK_ZERO_ID) {
            return Err(OrraError::validation("plan is missing task zero"));
        }
        if self.executable_tasks().next().is_none() {
            return Err(OrraError::validation("plan has no executable tasks"));
        }
        for task in self.executable_tasks() {
            if task.service.is_empty() {
                return Err(OrraError::validation(format!(
                    "task {:?} names no service",
                    task.id
                )));
            }
            for reference in task.references()? {
                if !ids.contains(reference.task_id.as_str()) {
                    return Err(OrraError::validation(format!(
                        "task {:?} references unknown task {:?}",
                        task.id, reference.task_id
                    )));
                }
            }
        }
        let deps = self.dependency_map()?;
        if let Some(cycle) = detect_cycle(&deps) {
            return Err(OrraError::validation(format!(
                "plan contains a cycle: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(())
    }
}

/// DFS cycle detection over the dependency map.
pub fn detect_cycle(deps: &HashMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        deps: &HashMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if path.iter().any(|p| p == node) {
            path.push(node.to_string());
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        path.push(node.to_string());
        if let Some(edges) = deps.get(node) {
            for dep in edges {
                if dfs(dep, deps, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    let mut visited = HashSet::new();
    for node in deps.keys() {
        let mut path = Vec::new();
        if dfs(node, deps, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_json(value: Value) -> Plan {
        serde_json::from_value(value).unwrap()
    }

    fn two_task_plan() -> Plan {
        plan_json(json!({
            "tasks": [
                {"id": "task0", "input": {"productId": "PROD-1"}},
                {"id": "task1", "service": "inventory-service",
                 "input": {"productId": "$task0.productId"}},
                {"id": "task2", "service": "delivery-service",
                 "input": {"reservation": "$task1.reservationId"}}
            ],
            "parallel_groups": [["task1"], ["task2"]]
        }))
    }

    #[test]
    fn parses_references_and_literals() {
        assert!(parse_reference("PROD-1").unwrap().is_none());
        let r = parse_reference("$task1.result.id").unwrap().unwrap();
        assert_eq!(r.task_id, "task1");
        assert_eq!(r.path, vec!["result", "id"]);
    }

    #[test]
    fn rejects_composite_expressions() {
        assert!(parse_reference("id-$task1.value").is_err());
        assert!(parse_reference("$task1.a-$task2.b").is_err());
    }

    #[test]
    fn dependency_map_skips_task_zero() {
        let plan = two_task_plan();
        let deps = plan.dependency_map().unwrap();
        assert!(deps["task1"].is_empty());
        assert_eq!(deps["task2"], BTreeSet::from(["task1".to_string()]));
    }

    #[test]
    fn validates_well_formed_plan() {
        assert!(two_task_plan().validate_structure().is_ok());
    }

    #[test]
    fn rejects_unknown_reference() {
        let plan = plan_json(json!({
            "tasks": [
                {"id": "task0", "input": {}},
                {"id": "task1", "service": "svc", "input": {"x": "$task9.y"}}
            ]
        }));
        assert!(plan.validate_structure().is_err());
    }

    #[test]
    fn rejects_cycle() {
        let plan = plan_json(json!({
            "tasks": [
                {"id": "task0", "input": {}},
                {"id": "task1", "service": "a", "input": {"x": "$task2.y"}},
                {"id": "task2", "service": "b", "input": {"x": "$task1.y"}}
            ]
        }));
        assert!(plan.validate_structure().is_err());
    }
}
