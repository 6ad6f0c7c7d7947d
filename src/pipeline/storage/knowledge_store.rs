use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rusqlite::Connection;

use super::embedder::cosine_similarity;
use super::types::KnowledgeStore;
use super::StoreError;
use crate::db::{self, repository};
use crate::models::*;

/// Brute-force cosine ranking, best first.
fn rank_chunks<'a>(
    chunks: impl Iterator<Item = &'a KnowledgeChunk>,
    query: &[f32],
    top_k: usize,
) -> Vec<KnowledgeHit> {
    let mut scored: Vec<KnowledgeHit> = chunks
        .map(|chunk| KnowledgeHit {
            score: cosine_similarity(query, &chunk.embedding),
            chunk: chunk.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    scored.truncate(top_k);
    scored
}

/// In-memory corpus for testing and small embedded deployments.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    chunks: RwLock<Vec<KnowledgeChunk>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(chunks: Vec<KnowledgeChunk>) -> Self {
        Self {
            chunks: RwLock::new(chunks),
        }
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<KnowledgeHit>, StoreError> {
        let chunks = self.chunks.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(rank_chunks(chunks.iter(), query, top_k))
    }

    async fn insert(&self, new_chunks: Vec<KnowledgeChunk>) -> Result<usize, StoreError> {
        let mut chunks = self.chunks.write().map_err(|_| StoreError::LockPoisoned)?;
        let count = new_chunks.len();
        for chunk in new_chunks {
            match chunks.iter_mut().find(|c| c.id == chunk.id) {
                Some(existing) => *existing = chunk,
                None => chunks.push(chunk),
            }
        }
        Ok(count)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.chunks.read().map_err(|_| StoreError::LockPoisoned)?.len())
    }
}

/// SQLite-backed corpus. Blocking work runs on the blocking pool.
pub struct SqliteKnowledgeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKnowledgeStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_connection(db::open_database(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<KnowledgeHit>, StoreError> {
        let query = query.to_vec();
        self.with_conn(move |conn| {
            let chunks = repository::get_all_knowledge_chunks(conn)?;
            Ok(rank_chunks(chunks.iter(), &query, top_k))
        })
        .await
    }

    async fn insert(&self, chunks: Vec<KnowledgeChunk>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db::DatabaseError::from)?;
            for chunk in &chunks {
                repository::upsert_knowledge_chunk(&tx, chunk)?;
            }
            tx.commit().map_err(db::DatabaseError::from)?;
            Ok(chunks.len())
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| Ok(repository::count_knowledge_chunks(conn)?))
            .await
    }
}
