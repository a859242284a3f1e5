use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use orra_types::{ActionParam, Plan, ServiceRecord, TASK_ZERO_ID};

use crate::settings::{EmbeddingsSettings, LlmSettings};
use crate::{Embedder, PlanGenerator};

/// Plan generator backed by an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatGenerator {
    settings: LlmSettings,
    client: Client,
}

impl OpenAiCompatGenerator {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    fn build_prompt(
        action: &str,
        params: &[ActionParam],
        catalog: &[ServiceRecord],
        grounding: Option<&Value>,
    ) -> String {
        let services: Vec<Value> = catalog
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "kind": s.kind.as_str(),
                    "description": s.description,
                    "input": s.schema.input,
                    "output": s.schema.output,
                })
            })
            .collect();
        let params: Vec<Value> = params
            .iter()
            .map(|p| json!({"field": p.field, "value": p.value}))
            .collect();
        let mut prompt = format!(
            "Decompose the action into an execution plan over the available services.\n\
             Action: {action}\n\
             Action params: {}\n\
             Services: {}\n\n\
             Respond with a single JSON object: {{\"tasks\": [...], \"parallel_groups\": [...]}}.\n\
             The first task must have id \"{TASK_ZERO_ID}\" and carry every action param as an \
             input field. Every other task names a service and an input object whose values are \
             literals or references of the form $taskId.field. Never concatenate a reference \
             with other text.",
            Value::Array(params),
            Value::Array(services),
        );
        if let Some(grounding) = grounding {
            prompt.push_str(&format!("\nGrounding: {grounding}"));
        }
        prompt
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.settings.api_key)
            .json(&json!({
                "model": self.settings.model,
                "messages": [{"role": "user", "content": prompt}],
                "stream": false,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("plan generation failed with status {status}"));
            anyhow::bail!(detail);
        }
        extract_text(&value)
            .ok_or_else(|| anyhow::anyhow!("reasoning model returned no completion content"))
    }
}

#[async_trait]
impl PlanGenerator for OpenAiCompatGenerator {
    async fn generate(
        &self,
        action: &str,
        params: &[ActionParam],
        catalog: &[ServiceRecord],
        grounding: Option<&Value>,
    ) -> anyhow::Result<Plan> {
        let prompt = Self::build_prompt(action, params, catalog, grounding);
        let mut last_err = None;
        // One retry on unparseable output; reasoning models occasionally wrap
        // the JSON in prose.
        for attempt in 0..2 {
            let text = self.complete(&prompt).await?;
            match extract_json_object(&text).and_then(|raw| serde_json::from_str::<Plan>(raw).ok())
            {
                Some(plan) => return Ok(plan),
                None => {
                    tracing::warn!(
                        target: "orra.providers",
                        attempt,
                        "plan generation produced unparseable output"
                    );
                    last_err = Some(anyhow::anyhow!(
                        "reasoning model did not return a parseable plan"
                    ));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("plan generation failed")))
    }
}

/// Embedder backed by an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbedder {
    settings: EmbeddingsSettings,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(settings: EmbeddingsSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.settings.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.settings.api_key)
            .json(&json!({
                "model": self.settings.model,
                "input": text,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("embedding request failed with status {status}"));
            anyhow::bail!(detail);
        }
        let embedding = value["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("embeddings response carried no vector"))?
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect::<Vec<f32>>();
        if embedding.is_empty() {
            anyhow::bail!("embeddings response carried an empty vector");
        }
        Ok(embedding)
    }
}

fn extract_error(value: &Value) -> Option<String> {
    value["error"]["message"]
        .as_str()
        .map(str::to_string)
        .or_else(|| value["error"].as_str().map(str::to_string))
}

fn extract_text(value: &Value) -> Option<String> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

/// First balanced JSON object embedded in the text.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
