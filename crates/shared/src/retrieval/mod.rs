use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use thiserror::Error;

use crate::models::RetrievedChunk;

mod documents;
mod embedding;
mod index;
mod knowledge_base;
mod splitter;

pub use documents::{
    SUPPORTED_EXTENSIONS, SourceDocument, document_text, fingerprint, is_supported_extension,
    load_documents,
};
pub use embedding::{Embedder, EmbedderConfig, EmbeddingError, EmbeddingFuture, OpenAiEmbedder};
pub use index::{IndexEntry, VectorIndex, cosine_similarity};
pub use knowledge_base::{KnowledgeBase, KnowledgeBaseConfig, SavedDocument};
pub use splitter::TextSplitter;

pub type RetrievalFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<RetrievedChunk>, RetrievalError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retriever unavailable: {0}")]
    Unavailable(String),
}

/// Returns up to `k` chunks relevant to `query`, best first.
pub trait Retriever: Send + Sync {
    fn retrieve<'a>(&'a self, query: &'a str, k: usize) -> RetrievalFuture<'a>;
}

#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("io error at {path}: {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("vector index is corrupt: {0}")]
    IndexCorrupt(String),
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("document text could not be read: {0}")]
    InvalidDocument(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl KnowledgeBaseError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
