use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

/// Pack an embedding as little-endian f32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Insert or replace a chunk. Rebuilds reuse stable ids, so replacing is
/// the expected path for an unchanged source.
pub fn upsert_knowledge_chunk(conn: &Connection, chunk: &KnowledgeChunk) -> Result<(), DatabaseError> {
    let tags_json = serde_json::to_string(&chunk.tags)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    conn.execute(
        "INSERT OR REPLACE INTO knowledge_chunks (id, source_document, text, embedding, dimension, tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            chunk.id.to_string(),
            chunk.source_document,
            chunk.text,
            encode_embedding(&chunk.embedding),
            chunk.embedding.len() as i64,
            tags_json,
        ],
    )?;
    Ok(())
}

pub fn get_all_knowledge_chunks(conn: &Connection) -> Result<Vec<KnowledgeChunk>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, source_document, text, embedding, tags_json
         FROM knowledge_chunks ORDER BY source_document, id",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(ChunkRow {
            id: row.get(0)?,
            source_document: row.get(1)?,
            text: row.get(2)?,
            embedding: row.get(3)?,
            tags_json: row.get(4)?,
        })
    })?;

    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(row?.into_chunk()?);
    }
    Ok(chunks)
}

pub fn count_knowledge_chunks(conn: &Connection) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge_chunks", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Remove every chunk of one source document. Returns the number removed.
pub fn delete_knowledge_source(conn: &Connection, source_document: &str) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM knowledge_chunks WHERE source_document = ?1",
        params![source_document],
    )?;
    Ok(deleted)
}

struct ChunkRow {
    id: String,
    source_document: String,
    text: String,
    embedding: Vec<u8>,
    tags_json: String,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<KnowledgeChunk, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            entity_type: "knowledge_chunk".into(),
            id: self.id.clone(),
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let embedding = decode_embedding(&self.embedding)
            .ok_or_else(|| corrupt("embedding length is not a multiple of 4".into()))?;
        let tags = serde_json::from_str(&self.tags_json).map_err(|e| corrupt(e.to_string()))?;

        Ok(KnowledgeChunk {
            id,
            text: self.text.clone(),
            source_document: self.source_document.clone(),
            embedding,
            tags,
        })
    }
}
