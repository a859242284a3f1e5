use std::collections::HashSet;

use orra_types::{ActionParam, Plan, ServiceRecord};

use crate::PlanValidator;

/// Structural plan validation: DAG shape, reference resolution, service
/// resolution and Task Zero parameter binding. Semantic (grounding-spec)
/// validation is a separate pluggable implementation.
#[derive(Debug, Clone, Default)]
pub struct DefaultPlanValidator;

impl DefaultPlanValidator {
    pub fn new() -> Self {
        Self
    }
}

impl PlanValidator for DefaultPlanValidator {
    fn validate(
        &self,
        plan: &Plan,
        catalog: &[ServiceRecord],
        params: &[ActionParam],
    ) -> Result<(), String> {
        plan.validate_structure().map_err(|e| e.to_string())?;

        let known: HashSet<&str> = catalog.iter().map(|s| s.name.as_str()).collect();
        for task in plan.executable_tasks() {
            if !known.contains(task.service.as_str()) {
                return Err(format!(
                    "task {:?} references unknown service {:?}",
                    task.id, task.service
                ));
            }
        }

        let task_zero = plan
            .task_zero()
            .ok_or_else(|| "plan is missing task zero".to_string())?;
        for param in params {
            if !task_zero.input.contains_key(&param.field) {
                return Err(format!(
                    "action param {:?} is not bound in task zero",
                    param.field
                ));
            }
        }
        // Task Zero leaves must be plain values: action params or named
        // literals, never references.
        for (field, value) in &task_zero.input {
            if let Some(text) = value.as_str() {
                if orra_types::parse_reference(text)
                    .map(|r| r.is_some())
                    .unwrap_or(true)
                {
                    return Err(format!(
                        "task zero field {field:?} must be a literal value"
                    ));
                }
            }
        }
        Ok(())
    }
}
