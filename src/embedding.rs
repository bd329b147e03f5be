//! Embedding providers and vector utilities.
//!
//! The store only requires the capability contract: turn a batch of texts
//! into fixed-width float vectors. Three providers cover it:
//!
//! - **`hash`** — deterministic local feature hashing. No network, no model
//!   download; adequate for lexical-adjacent similarity and the default.
//! - **`openai`** — calls an OpenAI-compatible embeddings endpoint.
//! - **`disabled`** — vector search off; hybrid degrades to lexical.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::{EmbeddingConfig, LLM_API_KEY_ENV};

/// A batch embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded with the vectors.
    fn model_name(&self) -> &str;
    /// Vector width.
    fn dims(&self) -> usize;
    /// Embed a batch, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
    http: reqwest::Client,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashProvider { dims: config.dims })),
        "openai" => Ok(Box::new(OpenAiProvider::new(config, http)?)),
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash provider ============

/// Deterministic feature-hashing embedder.
///
/// Tokens are hashed into `dims` buckets with a signed weight; the vector
/// is L2-normalized. Identical texts embed identically across processes,
/// which keeps vector search testable without any model.
pub struct HashProvider {
    dims: usize,
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
    }
}

fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if token.is_empty() {
            continue;
        }
        let mut hasher = Sha256::new();
        hasher.update(token.to_ascii_lowercase().as_bytes());
        let digest = hasher.finalize();
        let mut h = [0u8; 8];
        h.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(h);
        let bucket = (h % dims as u64) as usize;
        let sign = if h >> 63 == 1 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

// ============ OpenAI-compatible provider ============

/// Remote embeddings over an OpenAI-compatible `/embeddings` endpoint.
///
/// The credential is read from the environment per request and never
/// stored on the provider.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    endpoint: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig, http: reqwest::Client) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for the openai provider"))?;
        Ok(Self {
            model,
            dims: config.dims,
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            http,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var(LLM_API_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{} not set", LLM_API_KEY_ENV))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Embeddings API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
            embeddings.push(
                embedding
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }
        Ok(embeddings)
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_hash_embed_deterministic() {
        let a = hash_embed("write ahead log commit", 64);
        let b = hash_embed("write ahead log commit", 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_embed_normalized() {
        let v = hash_embed("some tokens to embed here", 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embed_similarity_ordering() {
        let dims = 128;
        let a = hash_embed("tokio async runtime task scheduling", dims);
        let b = hash_embed("tokio async runtime task spawning", dims);
        let c = hash_embed("grape jam breakfast recipe collection", dims);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
