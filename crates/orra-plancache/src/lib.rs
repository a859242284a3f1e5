//! Embedding-backed cache of generated plans. Keyed on the action text and
//! the sorted action-parameter names (values deliberately excluded, so
//! different values share one plan); gated on the service-catalog digest so
//! no cached plan survives a capability change.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use orra_providers::Embedder;
use orra_store::{keys, KvStore};
use orra_types::{ActionParam, OrraError, Plan, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCacheEntry {
    pub fingerprint: Vec<f32>,
    /// Sorted action-parameter names captured at generation time.
    pub param_names: Vec<String>,
    pub service_catalog_digest: String,
    /// The plan with Task Zero parameter slots left symbolic.
    pub plan_template: Plan,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub last_used: DateTime<Utc>,
}

impl PlanCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= self.ttl_ms as i64
    }
}

#[derive(Clone)]
pub struct PlanCache {
    kv: KvStore,
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
    ttl_ms: u64,
    max_entries_per_project: usize,
}

impl PlanCache {
    pub fn new(
        kv: KvStore,
        embedder: Arc<dyn Embedder>,
        similarity_threshold: f32,
        ttl_ms: u64,
        max_entries_per_project: usize,
    ) -> Self {
        Self {
            kv,
            embedder,
            similarity_threshold,
            ttl_ms,
            max_entries_per_project,
        }
    }

    fn fingerprint_text(action: &str, param_names: &[String]) -> String {
        format!("{action}\nparams: {}", param_names.join(","))
    }

    fn entry_key(
        project_id: &str,
        action: &str,
        param_names: &[String],
        catalog_digest: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(action.as_bytes());
        hasher.update(b"|");
        hasher.update(param_names.join(",").as_bytes());
        hasher.update(b"|");
        hasher.update(catalog_digest.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        keys::plancache_key(project_id, &hash[..32])
    }

    fn sorted_names(params: &[ActionParam]) -> Vec<String> {
        let mut names: Vec<String> = params.iter().map(|p| p.field.clone()).collect();
        names.sort();
        names
    }

    /// Similarity lookup. On a hit the template is cloned, the submitted
    /// parameter values are substituted into Task Zero and the entry's
    /// `last_used` is refreshed.
    pub async fn lookup(
        &self,
        project_id: &str,
        action: &str,
        params: &[ActionParam],
        catalog_digest: &str,
    ) -> Result<Option<Plan>> {
        let names = Self::sorted_names(params);
        let fingerprint = self
            .embedder
            .embed(&Self::fingerprint_text(action, &names))
            .await
            .map_err(|e| OrraError::Transient(e.to_string()))?;

        let now = Utc::now();
        let entries: Vec<(String, PlanCacheEntry)> = self
            .kv
            .list_prefix(&keys::plancache_prefix(project_id))
            .await?;

        let mut best: Option<(f32, String, PlanCacheEntry)> = None;
        for (key, entry) in entries {
            if entry.service_catalog_digest != catalog_digest
                || entry.is_expired(now)
                || entry.param_names != names
            {
                continue;
            }
            let score = cosine_similarity(&fingerprint, &entry.fingerprint);
            if score >= self.similarity_threshold
                && best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true)
            {
                best = Some((score, key, entry));
            }
        }

        let Some((score, key, mut entry)) = best else {
            return Ok(None);
        };
        tracing::debug!(target: "orra.plancache", project_id, score, "plan cache hit");
        entry.last_used = now;
        self.kv.put(&key, &entry).await?;
        Ok(Some(substitute_params(&entry.plan_template, params)))
    }

    /// Store a freshly generated, validated plan as a template.
    pub async fn insert(
        &self,
        project_id: &str,
        action: &str,
        params: &[ActionParam],
        catalog_digest: &str,
        plan: &Plan,
    ) -> Result<()> {
        let names = Self::sorted_names(params);
        let fingerprint = self
            .embedder
            .embed(&Self::fingerprint_text(action, &names))
            .await
            .map_err(|e| OrraError::Transient(e.to_string()))?;
        let now = Utc::now();
        let entry = PlanCacheEntry {
            fingerprint,
            param_names: names.clone(),
            service_catalog_digest: catalog_digest.to_string(),
            plan_template: template_from(plan, params),
            created_at: now,
            ttl_ms: self.ttl_ms,
            last_used: now,
        };
        self.kv
            .put(
                &Self::entry_key(project_id, action, &names, catalog_digest),
                &entry,
            )
            .await?;
        self.evict_lru(project_id).await
    }

    async fn evict_lru(&self, project_id: &str) -> Result<()> {
        let mut entries: Vec<(String, PlanCacheEntry)> = self
            .kv
            .list_prefix(&keys::plancache_prefix(project_id))
            .await?;
        if entries.len() <= self.max_entries_per_project {
            return Ok(());
        }
        entries.sort_by_key(|(_, e)| e.last_used);
        let excess = entries.len() - self.max_entries_per_project;
        for (key, _) in entries.into_iter().take(excess) {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }

    /// Drop expired entries across every project; returns how many were
    /// removed. Run hourly by the maintenance loop.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let entries: Vec<(String, PlanCacheEntry)> =
            self.kv.list_prefix("plancache/").await?;
        let mut removed = 0;
        for (key, entry) in entries {
            if entry.is_expired(now) && self.kv.delete(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(target: "orra.plancache", removed, "swept expired plan cache entries");
        }
        Ok(removed)
    }

    /// Hourly maintenance loop.
    pub fn spawn_sweeper(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_expired().await {
                    tracing::warn!(target: "orra.plancache", error = %err, "plan cache sweep failed");
                }
            }
        })
    }
}

/// Strip the submitted parameter values out of Task Zero, leaving the slots
/// symbolic. Named literals that are not action parameters stay verbatim.
pub fn template_from(plan: &Plan, params: &[ActionParam]) -> Plan {
    let mut template = plan.clone();
    if let Some(task_zero) = template.tasks.iter_mut().find(|t| t.is_task_zero()) {
        for param in params {
            if let Some(slot) = task_zero.input.get_mut(&param.field) {
                *slot = Value::Null;
            }
        }
    }
    template
}

/// Fill a template's Task Zero slots with the submitted values. The task
/// graph is never altered: values are the only thing that changes on a hit.
pub fn substitute_params(template: &Plan, params: &[ActionParam]) -> Plan {
    let mut plan = template.clone();
    if let Some(task_zero) = plan.tasks.iter_mut().find(|t| t.is_task_zero()) {
        for param in params {
            task_zero
                .input
                .insert(param.field.clone(), param.value.clone());
        }
    }
    plan
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}
