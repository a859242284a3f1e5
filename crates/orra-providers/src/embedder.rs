use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::Embedder;

const DIMENSION: usize = 256;

/// Deterministic feature-hash embedder for offline and air-gapped runs.
/// Token trigrams are hashed into a fixed-dimension bag; identical texts map
/// to identical vectors, unrelated texts to near-orthogonal ones. Used when
/// no `EMBEDDINGS_*` environment set is configured.
#[derive(Debug, Clone, Default)]
pub struct FeatureHashEmbedder;

impl FeatureHashEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn features(text: &str) -> Vec<String> {
        let normalized = text.to_lowercase();
        // Pure-numeric tokens are literal values (order ids, quantities) and
        // must not dominate the fingerprint: two actions that differ only in
        // an embedded identifier describe the same plan.
        let tokens: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
            .collect();
        let mut features: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        for pair in tokens.windows(2) {
            features.push(pair.join(" "));
        }
        features
    }
}

#[async_trait]
impl Embedder for FeatureHashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; DIMENSION];
        for feature in Self::features(text) {
            let digest = Sha256::digest(feature.as_bytes());
            let bucket = u16::from_be_bytes([digest[0], digest[1]]) as usize % DIMENSION;
            let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
