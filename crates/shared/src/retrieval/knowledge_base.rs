use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::documents::{self, SourceDocument, ensure_docs_dir, extension_of, supported_files};
use super::{
    Embedder, IndexEntry, KnowledgeBaseError, RetrievalError, RetrievalFuture, Retriever,
    TextSplitter, VectorIndex,
};
use crate::models::DocumentInfo;

#[derive(Debug, Clone)]
pub struct KnowledgeBaseConfig {
    pub docs_path: PathBuf,
    pub vector_store_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDocument {
    pub filename: String,
    pub document_count: usize,
}

/// Document directory plus the vector index built from it. Searches share a
/// read lock; rebuilds are serialized and swap the index in one step.
pub struct KnowledgeBase {
    config: KnowledgeBaseConfig,
    embedder: Arc<dyn Embedder>,
    splitter: TextSplitter,
    index: RwLock<VectorIndex>,
    rebuild_lock: Mutex<()>,
}

impl KnowledgeBase {
    pub fn new(config: KnowledgeBaseConfig, embedder: Arc<dyn Embedder>) -> Self {
        let splitter = TextSplitter::new(config.chunk_size, config.chunk_overlap);
        Self {
            config,
            embedder,
            splitter,
            index: RwLock::new(VectorIndex::default()),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn docs_path(&self) -> &Path {
        &self.config.docs_path
    }

    pub fn docs_path_exists(&self) -> bool {
        self.config.docs_path.is_dir()
    }

    pub fn index_exists(&self) -> bool {
        VectorIndex::exists(&self.config.vector_store_path)
    }

    pub async fn chunk_count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Loads the persisted index when it still matches the documents on disk,
    /// otherwise builds a new one. Returns the number of indexed chunks.
    pub async fn load_or_build(&self, force_rebuild: bool) -> Result<usize, KnowledgeBaseError> {
        let _rebuild = self.rebuild_lock.lock().await;

        if !force_rebuild && self.index_exists() {
            match self.load_persisted().await {
                Ok(Some(index)) => {
                    let chunks = index.len();
                    *self.index.write().await = index;
                    info!(chunks, "loaded existing vector index");
                    return Ok(chunks);
                }
                Ok(None) => info!("documents changed since last build, rebuilding vector index"),
                Err(err) => warn!(error = %err, "failed to load vector index, rebuilding"),
            }
        }

        self.build_locked().await
    }

    pub async fn rebuild(&self) -> Result<usize, KnowledgeBaseError> {
        let _rebuild = self.rebuild_lock.lock().await;
        self.build_locked().await
    }

    async fn load_persisted(&self) -> Result<Option<VectorIndex>, KnowledgeBaseError> {
        let store_path = self.config.vector_store_path.clone();
        let docs_path = self.config.docs_path.clone();
        let (index, current_fingerprint) = blocking(move || {
            let index = VectorIndex::load(&store_path)?;
            let loaded = documents::load_documents(&docs_path)?;
            Ok((index, documents::fingerprint(&loaded)))
        })
        .await?;

        if index.fingerprint() != current_fingerprint
            || index.embedding_model() != self.config.embedding_model
        {
            return Ok(None);
        }
        Ok(Some(index))
    }

    async fn build_locked(&self) -> Result<usize, KnowledgeBaseError> {
        let docs_path = self.config.docs_path.clone();
        let loaded = blocking(move || documents::load_documents(&docs_path)).await?;
        let fingerprint = documents::fingerprint(&loaded);

        let (texts, sources) = self.split_documents(&loaded);
        let embeddings = if texts.is_empty() {
            warn!("no document content found, vector index will be empty");
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if embeddings.len() != texts.len() {
            return Err(KnowledgeBaseError::IndexCorrupt(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        let entries = texts
            .into_iter()
            .zip(sources)
            .zip(embeddings)
            .map(|((text, source_id), embedding)| IndexEntry {
                text,
                source_id,
                embedding,
            })
            .collect::<Vec<_>>();
        let index = VectorIndex::new(self.config.embedding_model.clone(), fingerprint, entries);

        let store_path = self.config.vector_store_path.clone();
        let persisted = index.clone();
        blocking(move || persisted.save(&store_path)).await?;

        let chunks = index.len();
        *self.index.write().await = index;
        info!(documents = loaded.len(), chunks, "built vector index");
        Ok(chunks)
    }

    fn split_documents(&self, documents: &[SourceDocument]) -> (Vec<String>, Vec<String>) {
        let mut texts = Vec::new();
        let mut sources = Vec::new();
        for document in documents {
            for chunk in self.splitter.split_text(&document.content) {
                texts.push(chunk);
                sources.push(document.source_id.clone());
            }
        }
        (texts, sources)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentInfo>, KnowledgeBaseError> {
        let docs_path = self.config.docs_path.clone();
        blocking(move || {
            if !docs_path.is_dir() {
                return Ok(Vec::new());
            }

            let mut listed = Vec::new();
            for path in supported_files(&docs_path)? {
                let metadata = fs::metadata(&path).map_err(|err| KnowledgeBaseError::io(&path, err))?;
                listed.push(DocumentInfo {
                    filename: documents::source_id(&docs_path, &path),
                    size: metadata.len(),
                    extension: extension_of(&path)
                        .map(|ext| format!(".{ext}"))
                        .unwrap_or_default(),
                });
            }
            Ok(listed)
        })
        .await
    }

    /// Writes an uploaded document into the documents directory and rebuilds
    /// the index.
    pub async fn save_document(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<SavedDocument, KnowledgeBaseError> {
        let filename = sanitize_filename(filename)?;
        let extension = extension_of(Path::new(&filename)).unwrap_or_default();
        if !documents::is_supported_extension(&extension) {
            return Err(KnowledgeBaseError::UnsupportedFileType(if extension.is_empty() {
                filename
            } else {
                format!(".{extension}")
            }));
        }
        documents::document_text(&filename, &extension, &bytes)?;

        let docs_path = self.config.docs_path.clone();
        let target = docs_path.join(&filename);
        blocking(move || {
            ensure_docs_dir(&docs_path)?;
            fs::write(&target, bytes).map_err(|err| KnowledgeBaseError::io(&target, err))
        })
        .await?;
        info!(filename = %filename, "saved document");

        self.rebuild().await?;
        let document_count = self.list_documents().await?.len();
        Ok(SavedDocument {
            filename,
            document_count,
        })
    }

    /// Deletes a document by the id `list_documents` reports for it, which
    /// may include subdirectories, then rebuilds the index.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), KnowledgeBaseError> {
        let docs_path = self.config.docs_path.clone();
        let requested = document_id.to_string();
        let removed = blocking(move || {
            let target = resolve_document_path(&docs_path, &requested)?;
            fs::remove_file(&target).map_err(|err| KnowledgeBaseError::io(&target, err))?;
            Ok(documents::source_id(&docs_path, &target))
        })
        .await?;
        info!(document = %removed, "deleted document");

        self.rebuild().await?;
        Ok(())
    }
}

impl Retriever for KnowledgeBase {
    fn retrieve<'a>(&'a self, query: &'a str, k: usize) -> RetrievalFuture<'a> {
        Box::pin(async move {
            if k == 0 || self.index.read().await.is_empty() {
                return Ok(Vec::new());
            }

            let texts = vec![query.to_string()];
            let mut vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|err| RetrievalError::Unavailable(err.to_string()))?;
            let query_vector = vectors
                .pop()
                .ok_or_else(|| RetrievalError::Unavailable("empty embedding response".to_string()))?;

            Ok(self.index.read().await.search(&query_vector, k))
        })
    }
}

/// Keeps only the final path component so uploads cannot escape the
/// documents directory.
fn sanitize_filename(filename: &str) -> Result<String, KnowledgeBaseError> {
    let trimmed = filename.trim();
    let name = Path::new(trimmed)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(KnowledgeBaseError::InvalidFilename(trimmed.to_string()));
    }
    Ok(name.to_string())
}

/// Maps a document id onto an existing supported file inside `docs_path`.
/// Parent, root and prefix components are refused, and the canonical path
/// has to stay below the canonical documents directory.
fn resolve_document_path(
    docs_path: &Path,
    document_id: &str,
) -> Result<PathBuf, KnowledgeBaseError> {
    let trimmed = document_id.trim();
    let relative = Path::new(trimmed);
    let mut named = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(KnowledgeBaseError::InvalidFilename(trimmed.to_string()));
            }
        }
    }
    if !named {
        return Err(KnowledgeBaseError::InvalidFilename(trimmed.to_string()));
    }

    let target = docs_path.join(relative);
    let supported =
        extension_of(&target).is_some_and(|ext| documents::is_supported_extension(&ext));
    if !supported || !target.is_file() {
        return Err(KnowledgeBaseError::DocumentNotFound(trimmed.to_string()));
    }

    let root = docs_path
        .canonicalize()
        .map_err(|err| KnowledgeBaseError::io(docs_path, err))?;
    let canonical = target
        .canonicalize()
        .map_err(|err| KnowledgeBaseError::io(&target, err))?;
    if !canonical.starts_with(&root) {
        return Err(KnowledgeBaseError::InvalidFilename(trimmed.to_string()));
    }
    Ok(target)
}

async fn blocking<T, F>(task: F) -> Result<T, KnowledgeBaseError>
where
    F: FnOnce() -> Result<T, KnowledgeBaseError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| KnowledgeBaseError::Task(err.to_string()))?
}
