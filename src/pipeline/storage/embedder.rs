use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::EmbeddingModel;
use crate::pipeline::text::tokenize;

/// Default dimension of the hashing embedder.
pub const HASHING_DIM: usize = 256;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding service unreachable at {0}")]
    Connection(String),

    #[error("Embedding request failed: {0}")]
    HttpClient(String),

    #[error("Embedding service error ({status}): {body}")]
    Service { status: u16, body: String },

    #[error("Embedding response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::HttpClient(_) | Self::Service { .. }
        )
    }
}

/// Cosine similarity of two vectors; 0 for empty or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vec.iter_mut() {
            *val /= norm;
        }
    }
}

/// Deterministic bag-of-words embedder: each token is hashed into a signed
/// bucket. Texts sharing vocabulary land close together, which is enough
/// for a local corpus and for tests.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        l2_normalize(&mut vec);
        vec
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIM)
    }
}

#[async_trait]
impl EmbeddingModel for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Request body for Ollama /api/embeddings
#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Response body from Ollama /api/embeddings
#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeddings served by a local Ollama instance.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    EmbeddingError::Connection(self.base_url.clone())
                } else {
                    EmbeddingError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ResponseParsing(e.to_string()))?;

        if parsed.embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: parsed.embedding.len(),
            });
        }

        let mut embedding = parsed.embedding;
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_embed_returns_configured_dimension() {
        let embedder = HashingEmbedder::new(64);
        let vec = embedder.embed("Hello world").await.unwrap();
        assert_eq!(vec.len(), 64);
        assert_eq!(embedder.dimension(), 64);
    }

    #[test]
    fn hashing_embed_is_deterministic() {
        let embedder = HashingEmbedder::default();
        assert_eq!(embedder.embed_sync("same text"), embedder.embed_sync("same text"));
    }

    #[test]
    fn hashing_embed_is_l2_normalized() {
        let embedder = HashingEmbedder::default();
        let vec = embedder.embed_sync("test normalization of vectors");
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01, "got norm = {norm}");
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::default();
        assert!(embedder.embed_sync("").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn related_texts_score_higher_than_unrelated() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_sync("blood pressure 140/90 mmHg hypertension");
        let related = embedder.embed_sync("Hypertension is diagnosed when blood pressure stays above 140/90 mmHg.");
        let unrelated = embedder.embed_sync("ALT and AST are liver enzymes measured in U/L.");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn ollama_embedder_unreachable_is_transient() {
        let embedder =
            OllamaEmbedder::new("http://127.0.0.1:9", "nomic-embed-text", 768, Duration::from_millis(500))
                .unwrap();
        let err = embedder.embed("glucose").await.unwrap_err();
        assert!(err.is_transient());
    }
}
