//! Offline corpus build: chunk source documents, embed, tag and store.

use std::path::Path;
use std::sync::Arc;

use super::types::{EmbeddingModel, KnowledgeStore};
use super::StoreError;
use crate::models::*;
use crate::pipeline::text::tokenize;

/// Default upper bound on chunk size, in characters.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 800;
const MIN_CHUNK_CHARS: usize = 20;

/// Split a document into chunks: by `#` headings first, then by paragraph,
/// packing paragraphs up to `max_chars`. Oversized paragraphs are split at
/// sentence ends.
pub fn chunk_document(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for section in split_by_headings(text) {
        let mut current = String::new();
        for para in section.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let pieces = if para.chars().count() > max_chars {
                split_sentences_packed(para, max_chars)
            } else {
                vec![para.to_string()]
            };
            for piece in pieces {
                if !current.is_empty() && current.chars().count() + piece.chars().count() + 2 > max_chars {
                    chunks.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(&piece);
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
    }
    merge_tiny_chunks(chunks)
}

fn split_by_headings(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.starts_with('#') && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }
    sections
}

fn split_sentences_packed(para: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut sentence = String::new();
    for c in para.chars() {
        sentence.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '；') {
            push_sentence(&mut pieces, &mut current, &sentence, max_chars);
            sentence.clear();
        }
    }
    if !sentence.trim().is_empty() {
        push_sentence(&mut pieces, &mut current, &sentence, max_chars);
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

fn push_sentence(pieces: &mut Vec<String>, current: &mut String, sentence: &str, max_chars: usize) {
    if !current.is_empty() && current.chars().count() + sentence.chars().count() > max_chars {
        pieces.push(current.trim().to_string());
        current.clear();
    }
    current.push_str(sentence);
}

fn merge_tiny_chunks(chunks: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(prev)
                if chunk.chars().count() < MIN_CHUNK_CHARS
                    || prev.chars().count() < MIN_CHUNK_CHARS =>
            {
                prev.push_str("\n\n");
                prev.push_str(&chunk);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

/// Counts from a directory build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSummary {
    pub documents: usize,
    pub chunks: usize,
    /// Files that could not be read as UTF-8 text.
    pub skipped: Vec<String>,
}

/// Builds the knowledge index from plain-text or Markdown sources.
pub struct KnowledgeBaseBuilder {
    embedder: Arc<dyn EmbeddingModel>,
    store: Arc<dyn KnowledgeStore>,
    max_chunk_chars: usize,
    /// (metric key, space-padded token phrase) pairs used to tag chunks.
    vocabulary: Vec<(String, String)>,
}

impl KnowledgeBaseBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            embedder,
            store,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            vocabulary: Vec::new(),
        }
    }

    pub fn with_max_chunk_chars(mut self, max_chars: usize) -> Self {
        self.max_chunk_chars = max_chars.max(MIN_CHUNK_CHARS);
        self
    }

    /// Metric keys to tag chunks with. Each key also matches its spaced
    /// form (`blood_pressure` matches "blood pressure").
    pub fn with_metric_vocabulary<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for metric in metrics {
            let key = metric_key(metric.as_ref());
            let phrase = format!(" {} ", tokenize(&key.replace('_', " ")).join(" "));
            if !key.is_empty() {
                self.vocabulary.push((key, phrase));
            }
        }
        self
    }

    fn tags_for(&self, text: &str) -> Vec<String> {
        let padded = format!(" {} ", tokenize(text).join(" "));
        let mut tags: Vec<String> = self
            .vocabulary
            .iter()
            .filter(|(_, phrase)| padded.contains(phrase.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Chunk, embed and store one document. Returns the chunk count.
    pub async fn add_document(&self, source_document: &str, text: &str) -> Result<usize, StoreError> {
        let pieces = chunk_document(text, self.max_chunk_chars);
        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let embedding = self.embedder.embed(&piece).await?;
            chunks.push(KnowledgeChunk {
                id: KnowledgeChunk::stable_id(source_document, index),
                tags: self.tags_for(&piece),
                text: piece,
                source_document: source_document.to_string(),
                embedding,
            });
        }
        let stored = self.store.insert(chunks).await?;
        tracing::info!(source = source_document, chunks = stored, "Knowledge document indexed");
        Ok(stored)
    }

    /// Index every `.md` and `.txt` file directly under `dir`, in name order.
    pub async fn add_directory(&self, dir: &Path) -> Result<BuildSummary, StoreError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_text = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("txt"));
            if is_text {
                paths.push(path);
            }
        }
        paths.sort();

        let mut summary = BuildSummary::default();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    summary.chunks += self.add_document(&name, &text).await?;
                    summary.documents += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Skipping unreadable knowledge source");
                    summary.skipped.push(name);
                }
            }
        }
        tracing::info!(
            documents = summary.documents,
            chunks = summary.chunks,
            skipped = summary.skipped.len(),
            "Knowledge base build complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::{HashingEmbedder, InMemoryKnowledgeStore};

    const GUIDE: &str = "# Hypertension\n\nHypertension is diagnosed when blood pressure stays at or above 140/90 mmHg.\n\nLifestyle changes include reducing salt intake.\n\n# Diabetes\n\nA fasting glucose above 7.0 mmol/L on two occasions suggests diabetes.";

    #[test]
    fn chunks_split_on_headings() {
        let chunks = chunk_document(GUIDE, 800);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# Hypertension"));
        assert!(chunks[1].contains("fasting glucose"));
    }

    #[test]
    fn long_paragraph_is_split_at_sentences() {
        let para = "Sentence one is here. ".repeat(20);
        let chunks = chunk_document(&para, 100);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn tiny_chunks_are_merged() {
        let chunks = chunk_document("# A\n\nok\n\n# B\n\nThis section has enough text to stand alone.", 800);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunking_handles_multibyte_text() {
        let text = "高血压是指收缩压持续高于140毫米汞柱。".repeat(30);
        let chunks = chunk_document(&text, 100);
        assert!(chunks.len() > 1);
    }

    #[tokio::test]
    async fn add_document_tags_and_stores() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let builder = KnowledgeBaseBuilder::new(Arc::new(HashingEmbedder::default()), store.clone())
            .with_metric_vocabulary(["blood_pressure", "fasting_glucose", "alt"]);

        let stored = builder.add_document("guide.md", GUIDE).await.unwrap();
        assert_eq!(stored, 2);

        let query = HashingEmbedder::default().embed_sync("blood pressure hypertension");
        let hits = store.search(&query, 1).await.unwrap();
        assert_eq!(hits[0].chunk.tags, vec!["blood_pressure".to_string()]);
        assert_eq!(hits[0].chunk.id, KnowledgeChunk::stable_id("guide.md", 0));
    }

    #[tokio::test]
    async fn add_directory_indexes_text_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), GUIDE).unwrap();
        std::fs::write(dir.path().join("b.txt"), "ALT above 40 U/L suggests liver stress and warrants follow-up.").unwrap();
        std::fs::write(dir.path().join("c.pdf"), [0u8, 1, 2]).unwrap();

        let store = Arc::new(InMemoryKnowledgeStore::new());
        let builder = KnowledgeBaseBuilder::new(Arc::new(HashingEmbedder::default()), store.clone());
        let summary = builder.add_directory(dir.path()).await.unwrap();

        assert_eq!(summary.documents, 2);
        assert_eq!(summary.chunks, 3);
        assert_eq!(store.count().await.unwrap(), 3);
    }
}
