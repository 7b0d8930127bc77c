//! Per-KB lexical index: BM25 over chunk text via the `bm25` crate,
//! which exposes tunable `k1`/`b` unlike SQLite FTS5's fixed ranking
//! function — needed since `KBConfig` lets each KB tune both.
//!
//! The crate's `Scorer` has no removal primitive, so `delete_by_document`
//! rebuilds the scorer from the surviving chunk texts we keep cached for
//! exactly that purpose.

use bm25::{DefaultTokenizer, Embedder, EmbedderBuilder, Scorer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{ErrorKind, KError, KResult};

/// Approximate token count used only to seed/update avgdl; the crate's own
/// `DefaultTokenizer` is what actually tokenizes for scoring and already
/// case-folds and strips punctuation.
fn approx_token_count(text: &str) -> usize {
    text.unicode_words().count()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    chunk_id: String,
    document_id: String,
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<Entry>,
    k1: f32,
    b: f32,
}

pub struct LexicalHit {
    pub chunk_id: String,
    pub score: f32,
}

pub struct LexicalIndex {
    path: PathBuf,
    entries: Vec<Entry>,
    k1: f32,
    b: f32,
    embedder: Embedder<u32, DefaultTokenizer>,
    scorer: Scorer<String, u32>,
}

fn build_embedder(avgdl: f32, k1: f32, b: f32) -> Embedder<u32, DefaultTokenizer> {
    EmbedderBuilder::<u32, DefaultTokenizer>::with_avgdl(avgdl.max(1.0))
        .b(b)
        .k1(k1)
        .build()
}

fn avgdl(entries: &[Entry]) -> f32 {
    if entries.is_empty() {
        return 1.0;
    }
    let total: usize = entries.iter().map(|e| approx_token_count(&e.text)).sum();
    (total as f32 / entries.len() as f32).max(1.0)
}

impl LexicalIndex {
    /// Open the index at `path`, scoring with the given `k1`/`b` regardless
    /// of what was last persisted: these are caller-owned config, not index
    /// state, and must take effect without a reindex.
    pub fn open(path: &Path, k1: f32, b: f32) -> KResult<Self> {
        let entries = if path.exists() {
            let bytes = std::fs::read(path)?;
            let file: IndexFile = serde_json::from_slice(&bytes)
                .map_err(|e| KError::new(ErrorKind::IndexCorrupt, e.to_string()))?;
            file.entries
        } else {
            Vec::new()
        };

        let embedder = build_embedder(avgdl(&entries), k1, b);
        let mut scorer = Scorer::new();
        for entry in &entries {
            scorer.upsert(&entry.chunk_id, embedder.embed(&entry.text));
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            k1,
            b,
            embedder,
            scorer,
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
            k1: self.k1,
            b: self.b,
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| KError::internal(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Rebuild the embedder (new avgdl) and scorer from the current entry set.
    fn rebuild(&mut self) {
        self.embedder = build_embedder(avgdl(&self.entries), self.k1, self.b);
        let mut scorer = Scorer::new();
        for entry in &self.entries {
            scorer.upsert(&entry.chunk_id, self.embedder.embed(&entry.text));
        }
        self.scorer = scorer;
    }

    pub fn add(&mut self, chunk_id: &str, document_id: &str, text: &str) -> KResult<()> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.chunk_id == chunk_id) {
            existing.text = text.to_string();
            existing.document_id = document_id.to_string();
        } else {
            self.entries.push(Entry {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                text: text.to_string(),
            });
        }
        self.rebuild();
        self.persist()
    }

    pub fn add_batch(&mut self, rows: &[(String, String, String)]) -> KResult<()> {
        for (chunk_id, document_id, text) in rows {
            if let Some(existing) = self.entries.iter_mut().find(|e| &e.chunk_id == chunk_id) {
                existing.text = text.clone();
                existing.document_id = document_id.clone();
            } else {
                self.entries.push(Entry {
                    chunk_id: chunk_id.clone(),
                    document_id: document_id.clone(),
                    text: text.clone(),
                });
            }
        }
        self.rebuild();
        self.persist()
    }

    pub fn delete_by_document(&mut self, document_id: &str) -> KResult<()> {
        self.entries.retain(|e| e.document_id != document_id);
        self.rebuild();
        self.persist()
    }

    /// Re-score every entry under new `k1`/`b`, applying the change
    /// immediately without a full reindex.
    pub fn set_params(&mut self, k1: f32, b: f32) -> KResult<()> {
        self.k1 = k1;
        self.b = b;
        self.rebuild();
        self.persist()
    }

    /// Top-k chunks by BM25 score for `query`.
    pub fn search(&self, query: &str, k: usize) -> Vec<LexicalHit> {
        let embedding = self.embedder.embed(query);
        let mut hits: Vec<LexicalHit> = self
            .scorer
            .matches(&embedding)
            .into_iter()
            .map(|doc| LexicalHit {
                chunk_id: doc.id,
                score: doc.score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        hits
    }

    pub fn chunk_ids(&self) -> HashMap<String, ()> {
        self.entries.iter().map(|e| (e.chunk_id.clone(), ())).collect()
    }

    pub fn rename(from: &Path, to: &Path) -> KResult<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_finds_matching_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lexical.idx");
        let mut idx = LexicalIndex::open(&path, 1.2, 0.75).unwrap();
        idx.add("a", "doc1", "the quick brown fox").unwrap();
        idx.add("b", "doc1", "lorem ipsum dolor sit amet").unwrap();

        let hits = idx.search("quick fox", 5);
        assert_eq!(hits[0].chunk_id, "a");
    }

    #[test]
    fn delete_by_document_removes_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lexical.idx");
        let mut idx = LexicalIndex::open(&path, 1.2, 0.75).unwrap();
        idx.add("a", "doc1", "the quick brown fox").unwrap();
        idx.delete_by_document("doc1").unwrap();

        let hits = idx.search("quick fox", 5);
        assert!(hits.is_empty());
    }

    #[test]
    fn persists_and_reloads_across_open_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lexical.idx");
        {
            let mut idx = LexicalIndex::open(&path, 1.2, 0.75).unwrap();
            idx.add("a", "doc1", "the quick brown fox").unwrap();
        }
        let idx = LexicalIndex::open(&path, 1.2, 0.75).unwrap();
        assert_eq!(idx.len(), 1);
        let hits = idx.search("fox", 5);
        assert_eq!(hits[0].chunk_id, "a");
    }

    #[test]
    fn approx_token_count_ignores_punctuation() {
        assert_eq!(approx_token_count("Hello, World!"), 2);
    }
}
