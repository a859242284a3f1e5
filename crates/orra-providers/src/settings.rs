use orra_types::{OrraError, Result};

/// Reasoning-model settings, from the mandatory `LLM_*` environment set.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
}

impl LlmSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            model: require("LLM_MODEL")?,
            api_key: require("LLM_API_KEY")?,
            base_url: require("LLM_API_BASE_URL")?,
        })
    }
}

/// Embedding-model settings, from the `EMBEDDINGS_*` environment set.
/// Absent settings mean the engine falls back to the offline embedder.
#[derive(Debug, Clone)]
pub struct EmbeddingsSettings {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
}

impl EmbeddingsSettings {
    pub fn from_env() -> Option<Self> {
        let model = non_empty("EMBEDDINGS_MODEL")?;
        let api_key = non_empty("EMBEDDINGS_API_KEY")?;
        let base_url = non_empty("EMBEDDINGS_API_BASE_URL")?;
        Some(Self {
            model,
            api_key,
            base_url,
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require(name: &str) -> Result<String> {
    non_empty(name).ok_or_else(|| {
        OrraError::validation_param(name.to_string(), format!("{name} must be set"))
    })
}
