pub mod types;
pub mod embedder;
pub mod knowledge_store;
pub mod profile_store;
pub mod resilience;
pub mod knowledge_builder;

pub use embedder::{cosine_similarity, EmbeddingError, HashingEmbedder, OllamaEmbedder};
pub use knowledge_store::{InMemoryKnowledgeStore, SqliteKnowledgeStore};
pub use profile_store::{InMemoryProfileStore, SqliteProfileStore};
pub use resilience::{call_with_retry, CallPolicy};
pub use types::{AppendOutcome, EmbeddingModel, KnowledgeStore, ProfileStore};

use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Profile write conflict for user {user_id}: {reason}")]
    WriteConflict { user_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Embedding(e) => e.is_transient(),
            Self::Database(DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _))) => {
                matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}
