pub mod text;
pub mod storage; // Embedder, knowledge index, profile store, retry policy
pub mod rag; // Dual-path retrieval, context assembly, generation
pub mod safety; // Risk rules, draft validation, rule hot reload
pub mod profile; // Serialized profile writes and derived tags
