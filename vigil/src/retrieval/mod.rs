//! Retrieval: chunking, lexical scoring, and prompt context assembly.

mod builder;
mod chunker;
pub mod format;

pub use builder::{ChunkScorer, ContextBuilder, ScoredChunk, TfIdfScorer};
pub use chunker::chunk_text;
