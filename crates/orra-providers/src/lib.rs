mod embedder;
mod openai;
mod settings;
mod validate;

use async_trait::async_trait;
use serde_json::Value;

use orra_types::{ActionParam, Plan, ServiceRecord};

pub use embedder::FeatureHashEmbedder;
pub use openai::{HttpEmbedder, OpenAiCompatGenerator};
pub use settings::{EmbeddingsSettings, LlmSettings};
pub use validate::DefaultPlanValidator;

/// Produces an execution plan for an action against the current service
/// catalog. Implementations are external reasoning models.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(
        &self,
        action: &str,
        params: &[ActionParam],
        catalog: &[ServiceRecord],
        grounding: Option<&Value>,
    ) -> anyhow::Result<Plan>;
}

/// Produces a fixed-dimension vector representation of a text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Validates a generated plan against the catalog and the submitted action
/// parameters. Returns the rejection reason on failure.
pub trait PlanValidator: Send + Sync {
    fn validate(
        &self,
        plan: &Plan,
        catalog: &[ServiceRecord],
        params: &[ActionParam],
    ) -> Result<(), String>;
}
