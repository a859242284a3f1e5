use uuid::Uuid;

fn short() -> String {
    Uuid::new_v4().simple().to_string()[..24].to_string()
}

pub fn new_project_id() -> String {
    format!("p_{}", short())
}

pub fn new_service_id() -> String {
    format!("svc_{}", short())
}

pub fn new_orchestration_id() -> String {
    format!("o_{}", short())
}

pub fn new_compensation_id() -> String {
    format!("comp_{}", short())
}

pub fn new_execution_id() -> String {
    format!("exec_{}", short())
}

pub fn new_envelope_id() -> String {
    format!("env_{}", short())
}

pub fn new_event_id() -> String {
    format!("evt_{}", short())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(new_project_id().starts_with("p_"));
        assert!(new_service_id().starts_with("svc_"));
        assert!(new_orchestration_id().starts_with("o_"));
        assert!(new_compensation_id().starts_with("comp_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_execution_id(), new_execution_id());
    }
}
