use chrono::Utc;
use uuid::Uuid;

use orra_store::{keys, KvStore};
use orra_types::{new_project_id, OrraError, Project, Result};

fn mint_key() -> String {
    format!("sk-orra-{}", Uuid::new_v4().simple())
}

/// Project lifecycle and API-key authentication.
#[derive(Clone)]
pub struct ProjectStore {
    kv: KvStore,
}

impl ProjectStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn create(&self) -> Result<Project> {
        let project = Project {
            id: new_project_id(),
            created_at: Utc::now(),
            api_key: mint_key(),
            additional_api_keys: Vec::new(),
            webhooks: Vec::new(),
            compensation_failure_webhooks: Vec::new(),
        };
        self.kv
            .put(&keys::project_key(&project.id), &project)
            .await?;
        self.kv
            .put(&keys::apikey_key(&project.api_key), &project.id)
            .await?;
        tracing::info!(target: "orra.core", project_id = %project.id, "project created");
        Ok(project)
    }

    pub async fn get(&self, project_id: &str) -> Result<Project> {
        self.kv
            .get(&keys::project_key(project_id))
            .await?
            .ok_or_else(|| OrraError::NotFound(format!("project {project_id}")))
    }

    /// Resolve an API key to its project. Fails with `unauthorized` for
    /// unknown or revoked keys.
    pub async fn authenticate(&self, api_key: &str) -> Result<Project> {
        let project_id: Option<String> = self.kv.get(&keys::apikey_key(api_key)).await?;
        let Some(project_id) = project_id else {
            return Err(OrraError::Unauthorized("unknown API key".into()));
        };
        let project = self.get(&project_id).await?;
        if !project.accepts_key(api_key) {
            return Err(OrraError::Unauthorized("revoked API key".into()));
        }
        Ok(project)
    }

    /// Mint an additional service-facing key for the project.
    pub async fn mint_additional_key(&self, project_id: &str) -> Result<String> {
        let mut project = self.get(project_id).await?;
        let key = mint_key();
        project.additional_api_keys.push(key.clone());
        self.kv
            .put(&keys::project_key(project_id), &project)
            .await?;
        self.kv.put(&keys::apikey_key(&key), &project.id).await?;
        Ok(key)
    }

    pub async fn add_webhook(&self, project_id: &str, url: &str) -> Result<Project> {
        validate_webhook_url(url)?;
        let mut project = self.get(project_id).await?;
        if !project.webhooks.iter().any(|w| w == url) {
            project.webhooks.push(url.to_string());
        }
        self.kv
            .put(&keys::project_key(project_id), &project)
            .await?;
        Ok(project)
    }

    pub async fn add_compensation_failure_webhook(
        &self,
        project_id: &str,
        url: &str,
    ) -> Result<Project> {
        validate_webhook_url(url)?;
        let mut project = self.get(project_id).await?;
        if !project.compensation_failure_webhooks.iter().any(|w| w == url) {
            project.compensation_failure_webhooks.push(url.to_string());
        }
        self.kv
            .put(&keys::project_key(project_id), &project)
            .await?;
        Ok(project)
    }
}

fn validate_webhook_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(OrraError::validation_param(
            "url",
            "webhook url must be http(s)",
        ))
    }
}
