//! Per-KB vector index: brute-force cosine similarity over the KB's
//! chunk embeddings. A laptop-scale KB tops out in the tens of thousands of
//! chunks, well within reach of a linear scan at sub-100ms; an ANN structure
//! is a reasonable future swap but isn't warranted at this scale.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::embedding::cosine_similarity;
use crate::error::{ErrorKind, KError, KResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    chunk_id: String,
    document_id: String,
    vector: Vec<f32>,
}

/// A single match from [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<Entry>,
}

pub struct VectorIndex {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl VectorIndex {
    /// Load an existing index file, or start empty if none exists yet.
    pub fn open(path: &Path) -> KResult<Self> {
        let entries = if path.exists() {
            let bytes = std::fs::read(path)?;
            let file: IndexFile = serde_json::from_slice(&bytes)
                .map_err(|e| KError::new(ErrorKind::IndexCorrupt, e.to_string()))?;
            file.entries
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> KResult<()> {
        let file = IndexFile {
            entries: self.entries.clone(),
        };
        let bytes =
            serde_json::to_vec(&file).map_err(|e| KError::internal(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Add or replace a chunk's vector. Re-adding an existing chunk id
    /// overwrites its vector in place.
    pub fn add(&mut self, chunk_id: &str, document_id: &str, vector: Vec<f32>) -> KResult<()> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.chunk_id == chunk_id) {
            existing.vector = vector;
            existing.document_id = document_id.to_string();
        } else {
            self.entries.push(Entry {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                vector,
            });
        }
        self.persist()
    }

    pub fn add_batch(&mut self, rows: &[(String, String, Vec<f32>)]) -> KResult<()> {
        for (chunk_id, document_id, vector) in rows {
            if let Some(existing) = self.entries.iter_mut().find(|e| &e.chunk_id == chunk_id) {
                existing.vector = vector.clone();
                existing.document_id = document_id.clone();
            } else {
                self.entries.push(Entry {
                    chunk_id: chunk_id.clone(),
                    document_id: document_id.clone(),
                    vector: vector.clone(),
                });
            }
        }
        self.persist()
    }

    pub fn delete_by_document(&mut self, document_id: &str) -> KResult<()> {
        self.entries.retain(|e| e.document_id != document_id);
        self.persist()
    }

    /// Top-k by cosine similarity, ties broken by ascending chunk id for a
    /// stable order across runs.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<VectorHit> {
        let mut scored: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|e| VectorHit {
                chunk_id: e.chunk_id.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        scored
    }

    pub fn chunk_ids(&self) -> HashSet<String> {
        self.entries.iter().map(|e| e.chunk_id.clone()).collect()
    }

    /// Atomically rename the backing file, used by the reindex controller to
    /// publish a shadow index as the live one with zero downtime.
    pub fn rename(from: &Path, to: &Path) -> KResult<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_search_returns_closest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.idx");
        let mut idx = VectorIndex::open(&path).unwrap();
        idx.add("a", "doc1", vec![1.0, 0.0]).unwrap();
        idx.add("b", "doc1", vec![0.0, 1.0]).unwrap();
        idx.add("c", "doc1", vec![0.7071, 0.7071]).unwrap();

        let hits = idx.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn ties_break_by_chunk_id_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.idx");
        let mut idx = VectorIndex::open(&path).unwrap();
        idx.add("z", "doc1", vec![1.0, 0.0]).unwrap();
        idx.add("a", "doc1", vec![1.0, 0.0]).unwrap();

        let hits = idx.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits[1].chunk_id, "z");
    }

    #[test]
    fn delete_by_document_removes_its_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.idx");
        let mut idx = VectorIndex::open(&path).unwrap();
        idx.add("a", "doc1", vec![1.0, 0.0]).unwrap();
        idx.add("b", "doc2", vec![0.0, 1.0]).unwrap();
        idx.delete_by_document("doc1").unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.chunk_ids(), HashSet::from(["b".to_string()]));
    }

    #[test]
    fn persists_and_reloads_across_open_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.idx");
        {
            let mut idx = VectorIndex::open(&path).unwrap();
            idx.add("a", "doc1", vec![1.0, 0.0]).unwrap();
        }
        let idx = VectorIndex::open(&path).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn rename_moves_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("shadow.idx");
        let to = dir.path().join("vector.idx");
        let mut idx = VectorIndex::open(&from).unwrap();
        idx.add("a", "doc1", vec![1.0, 0.0]).unwrap();
        VectorIndex::rename(&from, &to).unwrap();
        assert!(!from.exists());
        let reloaded = VectorIndex::open(&to).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
