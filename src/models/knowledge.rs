use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A passage of the authoritative medical corpus with its embedding.
/// Built offline; read-only at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub text: String,
    pub source_document: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
}

impl KnowledgeChunk {
    /// Stable id derived from source and position, so rebuilding the index
    /// from the same corpus yields the same chunk ids.
    pub fn stable_id(source_document: &str, index: usize) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{source_document}#{index}").as_bytes(),
        )
    }

    pub fn provenance_tag(&self) -> String {
        format!("knowledge:{}#{}", self.source_document, self.id)
    }
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub chunk: KnowledgeChunk,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}
