use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::KnowledgeBaseError;
use crate::models::RetrievedChunk;

const INDEX_FILE_NAME: &str = "index.json";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub source_id: String,
    pub embedding: Vec<f32>,
}

/// Exact nearest-neighbour index over chunk embeddings, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorIndex {
    version: u32,
    embedding_model: String,
    /// Digest of the documents the index was built from.
    fingerprint: String,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn new(embedding_model: String, fingerprint: String, entries: Vec<IndexEntry>) -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            embedding_model,
            fingerprint,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Top `k` entries by cosine similarity, best first. Entries whose
    /// dimension differs from the query are skipped.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut scored = self
            .entries
            .iter()
            .filter_map(|entry| {
                cosine_similarity(query, &entry.embedding).map(|score| (entry, score))
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.1.partial_cmp(&left.1).unwrap_or(Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(entry, score)| RetrievedChunk {
                text: entry.text.clone(),
                source_id: entry.source_id.clone(),
                score,
            })
            .collect()
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE_NAME)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::file_path(dir).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self, KnowledgeBaseError> {
        let path = Self::file_path(dir);
        let raw = fs::read_to_string(&path).map_err(|err| KnowledgeBaseError::io(&path, err))?;
        let index: Self = serde_json::from_str(&raw)
            .map_err(|err| KnowledgeBaseError::IndexCorrupt(err.to_string()))?;
        if index.version != INDEX_FORMAT_VERSION {
            return Err(KnowledgeBaseError::IndexCorrupt(format!(
                "unsupported index version {}",
                index.version
            )));
        }
        Ok(index)
    }

    pub fn save(&self, dir: &Path) -> Result<(), KnowledgeBaseError> {
        fs::create_dir_all(dir).map_err(|err| KnowledgeBaseError::io(dir, err))?;
        let path = Self::file_path(dir);
        let tmp_path = dir.join(format!("{INDEX_FILE_NAME}.tmp"));
        let payload = serde_json::to_vec(self)
            .map_err(|err| KnowledgeBaseError::IndexCorrupt(err.to_string()))?;
        fs::write(&tmp_path, payload).map_err(|err| KnowledgeBaseError::io(&tmp_path, err))?;
        fs::rename(&tmp_path, &path).map_err(|err| KnowledgeBaseError::io(&path, err))
    }
}

pub fn cosine_similarity(query: &[f32], candidate: &[f32]) -> Option<f32> {
    if query.is_empty() || query.len() != candidate.len() {
        return None;
    }

    let (dot, query_sq, candidate_sq) = query.iter().zip(candidate).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(dot, q, c), (left, right)| (dot + left * right, q + left * left, c + right * right),
    );
    let denom = query_sq.sqrt() * candidate_sq.sqrt();
    if denom <= f32::EPSILON {
        return Some(0.0);
    }
    Some(dot / denom)
}
