use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{OrraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Service,
    Agent,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Service => "service",
            ServiceKind::Agent => "agent",
        }
    }
}

/// JSON-Schema-shaped input/output contract carried by a registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSchema {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub description: String,
    pub schema: ServiceSchema,
    /// Monotonic; bumped on any spec-affecting change.
    pub version: u64,
    #[serde(default)]
    pub revertible: bool,
    /// Required iff `revertible`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_ttl_ms: Option<u64>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// True when the incoming spec differs in any way that must bump the
    /// stored version.
    pub fn spec_differs(&self, other: &ServiceRecord) -> bool {
        self.name != other.name
            || self.description != other.description
            || self.revertible != other.revertible
            || self.revert_ttl_ms != other.revert_ttl_ms
            || serde_json::to_string(&self.schema).ok() != serde_json::to_string(&other.schema).ok()
    }
}

/// Name rule: 3-63 chars, lowercase alphanumerics plus `-` and `.`,
/// alphanumeric at both ends.
pub fn validate_service_name(name: &str) -> Result<()> {
    let bad = |msg: &str| OrraError::validation_param("name", msg.to_string());
    if name.len() < 3 || name.len() > 63 {
        return Err(bad("service name must be 3-63 characters"));
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return Err(bad("service name must start and end with an alphanumeric"));
    }
    for &b in bytes {
        let ok = b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.';
        if !ok {
            return Err(bad(
                "service name may only contain lowercase alphanumerics, '-' and '.'",
            ));
        }
    }
    Ok(())
}
