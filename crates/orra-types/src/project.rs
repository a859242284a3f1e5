use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A project scopes services, orchestrations and API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Primary key minted at creation; authenticates the CLI collaborator.
    pub api_key: String,
    /// Additional service-facing keys. Revoked keys are removed from this
    /// list; live connections opened under them persist until disconnect.
    #[serde(default)]
    pub additional_api_keys: Vec<String>,
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default)]
    pub compensation_failure_webhooks: Vec<String>,
}

impl Project {
    pub fn accepts_key(&self, key: &str) -> bool {
        self.api_key == key || self.additional_api_keys.iter().any(|k| k == key)
    }
}
