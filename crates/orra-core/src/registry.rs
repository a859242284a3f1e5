use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use orra_store::{keys, KvStore};
use orra_types::{
    new_service_id, validate_service_name, OrraError, Result, ServiceKind, ServiceRecord,
    ServiceSchema,
};

/// Incoming registration body for a service or agent.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: ServiceSchema,
    #[serde(default)]
    pub revertible: bool,
    #[serde(default)]
    pub revert_ttl_ms: Option<u64>,
}

/// Tracks registered services and agents per project.
#[derive(Clone)]
pub struct ServiceRegistry {
    kv: KvStore,
}

impl ServiceRegistry {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Create or update a registration. An unchanged spec keeps its version;
    /// any spec-affecting change bumps it. In-flight tasks keep the version
    /// they were frozen with.
    pub async fn register(
        &self,
        project_id: &str,
        kind: ServiceKind,
        spec: RegistrationSpec,
    ) -> Result<ServiceRecord> {
        validate_service_name(&spec.name)?;
        if spec.revertible && spec.revert_ttl_ms.map(|ttl| ttl == 0).unwrap_or(true) {
            return Err(OrraError::validation_param(
                "revertTTL",
                "revertible services must declare a positive revert TTL",
            ));
        }

        let existing = match &spec.id {
            Some(id) => {
                let record = self.lookup(project_id, id).await?;
                Some(record)
            }
            None => self.lookup_by_name(project_id, &spec.name).await?,
        };

        // Names are unique within a project across distinct service ids.
        if let Some(holder) = self.lookup_by_name(project_id, &spec.name).await? {
            let same = existing.as_ref().map(|e| e.id == holder.id).unwrap_or(false);
            if !same {
                return Err(OrraError::validation_param(
                    "name",
                    format!("service name {:?} is already registered", spec.name),
                ));
            }
        }

        let now = Utc::now();
        let record = match existing {
            Some(current) => {
                let candidate = ServiceRecord {
                    name: spec.name,
                    description: spec.description,
                    schema: spec.schema,
                    revertible: spec.revertible,
                    revert_ttl_ms: if spec.revertible { spec.revert_ttl_ms } else { None },
                    updated_at: now,
                    ..current.clone()
                };
                if current.spec_differs(&candidate) {
                    ServiceRecord {
                        version: current.version + 1,
                        ..candidate
                    }
                } else {
                    // Identical spec: no-op, keep stored record untouched.
                    current
                }
            }
            None => ServiceRecord {
                id: new_service_id(),
                project_id: project_id.to_string(),
                name: spec.name,
                kind,
                description: spec.description,
                schema: spec.schema,
                version: 1,
                revertible: spec.revertible,
                revert_ttl_ms: if spec.revertible { spec.revert_ttl_ms } else { None },
                registered_at: now,
                updated_at: now,
            },
        };

        if record.kind != kind {
            return Err(OrraError::InvalidOperation(format!(
                "{} is registered as a {}",
                record.name,
                record.kind.as_str()
            )));
        }

        self.kv
            .put(&keys::service_key(project_id, &record.id), &record)
            .await?;
        tracing::info!(
            target: "orra.core",
            project_id,
            service_id = %record.id,
            name = %record.name,
            version = record.version,
            "service registered"
        );
        Ok(record)
    }

    /// Lookup by id. Missing ids surface as not-found.
    pub async fn lookup(&self, project_id: &str, service_id: &str) -> Result<ServiceRecord> {
        self.kv
            .get(&keys::service_key(project_id, service_id))
            .await?
            .ok_or_else(|| OrraError::NotFound(format!("service {service_id}")))
    }

    pub async fn lookup_by_name(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<Option<ServiceRecord>> {
        Ok(self
            .list(project_id)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<ServiceRecord>> {
        let entries: Vec<(String, ServiceRecord)> = self
            .kv
            .list_prefix(&keys::service_prefix(project_id))
            .await?;
        Ok(entries.into_iter().map(|(_, s)| s).collect())
    }

    /// Stable hash of the project's service catalog. Any registration that
    /// bumps a version changes the digest, invalidating cached plans.
    pub async fn catalog_digest(&self, project_id: &str) -> Result<String> {
        let mut services = self.list(project_id).await?;
        services.sort_by(|a, b| a.id.cmp(&b.id));
        let mut hasher = Sha256::new();
        for service in &services {
            hasher.update(service.id.as_bytes());
            hasher.update(b"|");
            hasher.update(service.name.as_bytes());
            hasher.update(b"|");
            hasher.update(service.version.to_be_bytes());
            hasher.update(b"|");
            hasher.update(schema_digest(&service.schema).as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

pub fn schema_digest(schema: &ServiceSchema) -> String {
    let raw = serde_json::to_string(schema).unwrap_or_default();
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}
