//! Durable key layout. Everything the engine persists lives under one of
//! these prefixes; cross-component references are by opaque id + lookup.

pub fn project_key(project_id: &str) -> String {
    format!("project/{project_id}")
}

pub fn project_prefix() -> &'static str {
    "project/"
}

pub fn apikey_key(key: &str) -> String {
    format!("apikey/{key}")
}

pub fn apikey_prefix() -> &'static str {
    "apikey/"
}

pub fn service_key(project_id: &str, service_id: &str) -> String {
    format!("service/{project_id}/{service_id}")
}

pub fn service_prefix(project_id: &str) -> String {
    format!("service/{project_id}/")
}

pub fn orchestration_key(project_id: &str, orchestration_id: &str) -> String {
    format!("orchestration/{project_id}/{orchestration_id}")
}

pub fn orchestration_prefix(project_id: &str) -> String {
    format!("orchestration/{project_id}/")
}

/// Task records hang off their orchestration.
pub fn task_key(orchestration_id: &str, task_id: &str) -> String {
    format!("task/{orchestration_id}/{task_id}")
}

pub fn task_prefix(orchestration_id: &str) -> String {
    format!("task/{orchestration_id}/")
}

/// Offsets are zero-padded so lexicographic key order equals offset order.
pub fn log_key(orchestration_id: &str, offset: u64) -> String {
    format!("log/{orchestration_id}/{offset:010}")
}

pub fn log_prefix(orchestration_id: &str) -> String {
    format!("log/{orchestration_id}/")
}

pub fn idempotency_entry_key(service_id: &str, idempotency_key: &str) -> String {
    format!("idemp/{service_id}/{idempotency_key}")
}

pub fn idempotency_prefix() -> &'static str {
    "idemp/"
}

pub fn compensation_key(orchestration_id: &str, compensation_id: &str) -> String {
    format!("compensation/{orchestration_id}/{compensation_id}")
}

pub fn compensation_prefix(orchestration_id: &str) -> String {
    format!("compensation/{orchestration_id}/")
}

pub fn plancache_key(project_id: &str, fingerprint_hash: &str) -> String {
    format!("plancache/{project_id}/{fingerprint_hash}")
}

pub fn plancache_prefix(project_id: &str) -> String {
    format!("plancache/{project_id}/")
}

pub fn grounding_key(project_id: &str, name: &str) -> String {
    format!("grounding/{project_id}/{name}")
}

pub fn grounding_prefix(project_id: &str) -> String {
    format!("grounding/{project_id}/")
}
