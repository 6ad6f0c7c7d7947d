pub mod retrieval;
pub mod rerank;
pub mod context;
pub mod prompt;
pub mod generation;

pub use context::{AssembledContext, ContextAssembler, ContextItem};
pub use generation::{GenerationError, LlmGenerate, OllamaGenerator};
pub use rerank::{LexicalReranker, RerankedHit, Reranker};
pub use retrieval::{DualPathRetriever, RetrievalOutcome};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Retrieval unavailable: knowledge path failed ({knowledge}); profile path failed ({profile})")]
    Unavailable { knowledge: String, profile: String },
}
