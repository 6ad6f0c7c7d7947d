use async_trait::async_trait;

use super::embedder::EmbeddingError;
use super::StoreError;
use crate::models::*;

/// Embedding model abstraction
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    fn dimension(&self) -> usize;
}

/// Similarity search over the embedded authoritative corpus.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Nearest neighbours by cosine similarity, best first.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<KnowledgeHit>, StoreError>;

    /// Offline build path. Returns the number of chunks written.
    async fn insert(&self, chunks: Vec<KnowledgeChunk>) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Outcome of appending a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same snapshot id already stored; nothing written.
    AlreadyPresent,
}

/// Structured access to longitudinal profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Full record; an unknown user yields an empty record.
    async fn load(&self, user_id: &str) -> Result<ProfileRecord, StoreError>;

    /// Append to the end of the user's history. Idempotent per snapshot id;
    /// a snapshot older than the latest entry is a `WriteConflict`.
    async fn append_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<AppendOutcome, StoreError>;

    async fn save_derived_tags(&self, user_id: &str, tags: &DerivedRiskTags) -> Result<(), StoreError>;

    /// Users with at least one stored snapshot, sorted.
    async fn list_users(&self) -> Result<Vec<String>, StoreError>;
}
