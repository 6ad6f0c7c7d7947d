//! Second-stage scoring of knowledge hits against the finding that
//! retrieved them. Vector search casts a wide net; the reranker decides
//! which hits are worth the context budget.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::models::KnowledgeHit;
use crate::pipeline::storage::StoreError;
use crate::pipeline::text::text_similarity;

#[derive(Debug, Clone)]
pub struct RerankedHit {
    pub hit: KnowledgeHit,
    /// Relevance to the query in [0, 1].
    pub relevance: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score every hit against `query`. Output order is not significant.
    async fn score(&self, query: &str, hits: Vec<KnowledgeHit>) -> Result<Vec<RerankedHit>, StoreError>;
}

/// Term-overlap relevance. Needs no model, so it is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(&self, query: &str, hits: Vec<KnowledgeHit>) -> Result<Vec<RerankedHit>, StoreError> {
        Ok(hits
            .into_iter()
            .map(|hit| {
                let relevance = text_similarity(query, &hit.chunk.text);
                RerankedHit { hit, relevance }
            })
            .collect())
    }
}

/// Best first, dropping hits under `threshold` and keeping at most `top_k`.
/// Equal relevance falls back to the vector score.
pub fn select(mut reranked: Vec<RerankedHit>, threshold: f64, top_k: Option<usize>) -> Vec<RerankedHit> {
    reranked.retain(|r| r.relevance >= threshold);
    reranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(Ordering::Equal))
    });
    if let Some(k) = top_k {
        reranked.truncate(k);
    }
    reranked
}
