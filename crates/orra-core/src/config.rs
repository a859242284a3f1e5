use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use orra_types::Result;
use orra_wire::ReconnectPolicy;

/// Engine configuration. Every knob has a production default; a JSON config
/// file may override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-orchestration (and per-task) execution timeout.
    pub orchestration_timeout_ms: u64,
    /// Default window a disconnected service gets to return before waiting
    /// orchestrations fail.
    pub health_grace_period_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub message_max_bytes: usize,
    pub queue_max_depth: usize,
    pub idempotency_retention_ms: u64,
    pub plan_cache_ttl_ms: u64,
    pub plan_cache_max_entries_per_project: usize,
    pub plan_cache_similarity_threshold: f32,
    pub compensation_max_attempts: u32,
    pub compensation_attempt_budget_ms: u64,
    pub webhook_max_attempts: u32,
    pub webhook_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orchestration_timeout_ms: 30_000,
            health_grace_period_ms: 30 * 60 * 1000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_max_attempts: 10,
            reconnect_initial_backoff_ms: 1_000,
            reconnect_max_backoff_ms: 30_000,
            message_max_bytes: 10 * 1024 * 1024,
            queue_max_depth: 1000,
            idempotency_retention_ms: 24 * 60 * 60 * 1000,
            plan_cache_ttl_ms: 24 * 60 * 60 * 1000,
            plan_cache_max_entries_per_project: 100,
            plan_cache_similarity_threshold: 0.95,
            compensation_max_attempts: 10,
            compensation_attempt_budget_ms: 30_000,
            webhook_max_attempts: 10,
            webhook_workers: 4,
        }
    }
}

impl EngineConfig {
    /// The reconnection contract advertised to SDK clients of the service
    /// channel.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }

    /// Defaults overlaid with the JSON config file when present.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }
}
