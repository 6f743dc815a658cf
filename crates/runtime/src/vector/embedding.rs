//! Embedding providers
//!
//! Text is turned into fixed-length vectors either by a local HTTP
//! embedding endpoint or by a deterministic byte-derived fallback that
//! needs no model at all. Both sit behind the [`Embedder`] trait.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::types::VectorError;

/// Text-to-vector contract used by the note manager and the orchestrator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError>;

    fn dimension(&self) -> usize;
}

/// Deterministic embedding derived from the text's bytes, normalized to
/// unit length. Carries no semantics but keeps the full retrieval path
/// exercisable without an embedding model.
pub struct DeterministicEmbedder {
    dimension: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for DeterministicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Err(VectorError::InvalidEmbedding {
                reason: "cannot embed empty text".to_string(),
            });
        }

        let mut embedding = vec![0.0f32; self.dimension];
        for (i, val) in embedding.iter_mut().enumerate() {
            let byte = bytes[i % bytes.len()];
            *val = (byte as f32 / 255.0) * 2.0 - 1.0;
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut embedding {
                *val /= magnitude;
            }
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedder backed by an Ollama-style `/api/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "model": self.model, "prompt": text });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::EmbeddingFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VectorError::EmbeddingFailed(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| VectorError::EmbeddingFailed(e.to_string()))?;

        if parsed.embedding.len() != self.dimension {
            return Err(VectorError::InvalidEmbedding {
                reason: format!(
                    "endpoint returned dimension {}, expected {}",
                    parsed.embedding.len(),
                    self.dimension
                ),
            });
        }
        Ok(parsed.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_embedder_is_stable_and_normalized() {
        let embedder = DeterministicEmbedder::new(384);
        let a = embedder.embed("sales by region").await.unwrap();
        let b = embedder.embed("sales by region").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn deterministic_embedder_rejects_empty_text() {
        let embedder = DeterministicEmbedder::new(16);
        assert!(embedder.embed("").await.is_err());
    }
}
