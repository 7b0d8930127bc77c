//! Knowledge-base manager: owns one handle per KB (storage, both
//! indices, a write lock serializing ingest/delete/reindex, and a reindex
//! lock) and the instance-wide knowledge-bases directory.
//!
//! Queries never take the write lock — only ingestion, document deletion,
//! and reindex do — so any number of queries run concurrently against a KB
//! while a writer holds it ("KB-level write serialization... Queries do
//! not [take the lock]").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::embedding::{EmbeddingProvider, EmbeddingSettings};
use crate::error::{KError, KResult};
use crate::extract::OcrProvider;
use crate::ingest;
use crate::lexical_index::LexicalIndex;
use crate::models::{Document, KBConfig, KnowledgeBase, ToolServerKind};
use crate::progress::{NoProgress, ProgressReporter};
use crate::reindex::{self, ReindexLock};
use crate::retriever::{self, RetrievedChunk};
use crate::storage::Storage;
use crate::tool_server::ToolServerSupervisor;
use crate::vector_index::VectorIndex;

/// Everything the manager needs to operate on one KB.
pub struct KbHandle {
    pub kb: RwLock<KnowledgeBase>,
    pub dir: PathBuf,
    pub storage: Storage,
    pub vector_index: RwLock<VectorIndex>,
    pub lexical_index: RwLock<LexicalIndex>,
    pub write_lock: Mutex<()>,
    pub reindex_lock: ReindexLock,
}

impl KbHandle {
    async fn open(dir: PathBuf, kb: KnowledgeBase) -> KResult<Self> {
        let storage = Storage::open(&dir, &kb).await?;
        let vector_index = VectorIndex::open(&dir.join("vector.idx"))?;
        let lexical_index =
            LexicalIndex::open(&dir.join("lexical.idx"), kb.config.bm25_k1, kb.config.bm25_b)?;
        Ok(Self {
            kb: RwLock::new(kb),
            dir,
            storage,
            vector_index: RwLock::new(vector_index),
            lexical_index: RwLock::new(lexical_index),
            write_lock: Mutex::new(()),
            reindex_lock: ReindexLock::new(),
        })
    }
}

/// Manages the lifecycle of every knowledge base under one data root.
///
/// Optionally coordinates with a [`ToolServerSupervisor`] so KB lifecycle
/// events reach the tool-server fleet: created KBs get a default server,
/// renames restart servers that were serving them, deletions drop them from
/// any server's KB set. Callers that only need document/query operations
/// (`kbasectl doc`, `kbasectl query`, the tool-server runtime itself) never
/// attach one and pay nothing for it.
pub struct KnowledgeBaseManager {
    root: PathBuf,
    handles: RwLock<HashMap<String, Arc<KbHandle>>>,
    tool_servers: RwLock<Option<Arc<ToolServerSupervisor>>>,
}

impl KnowledgeBaseManager {
    /// Load every existing KB directory under `<root>/knowledge-bases/`.
    pub async fn open(root: &Path) -> KResult<Self> {
        let kb_root = root.join("knowledge-bases");
        std::fs::create_dir_all(&kb_root)?;

        let mut handles = HashMap::new();
        for entry in std::fs::read_dir(&kb_root)?.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let kb_dir = entry.path();
            let meta_db = kb_dir.join("meta.db");
            if !meta_db.exists() {
                continue;
            }
            if let Some(handle) = Self::load_existing(&kb_dir).await? {
                let id = handle.kb.read().await.id.clone();
                handles.insert(id, Arc::new(handle));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            handles: RwLock::new(handles),
            tool_servers: RwLock::new(None),
        })
    }

    /// Wire this manager to a tool-server supervisor so KB lifecycle events
    /// (create/rename/delete) propagate to the served tool-server fleet.
    pub async fn attach_tool_servers(&self, supervisor: Arc<ToolServerSupervisor>) {
        *self.tool_servers.write().await = Some(supervisor);
    }

    async fn load_existing(kb_dir: &Path) -> KResult<Option<KbHandle>> {
        // A minimal placeholder KB is enough for `Storage::open` to attach to
        // the existing `kb_info` row; the real identity/config is read back
        // from that row immediately after.
        let placeholder = KnowledgeBase {
            id: kb_dir.file_name().unwrap().to_string_lossy().into_owned(),
            name: String::new(),
            description: None,
            created_at: Utc::now(),
            config: KBConfig::default(),
            generation: 0,
        };
        let storage = Storage::open(kb_dir, &placeholder).await?;
        let kb = storage.load_kb_identity().await?;
        storage.close().await;

        Ok(Some(KbHandle::open(kb_dir.to_path_buf(), kb).await?))
    }

    pub async fn create(&self, name: &str, description: Option<String>, config: KBConfig) -> KResult<KnowledgeBase> {
        config.validate()?;
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join("knowledge-bases").join(&id);
        let kb = KnowledgeBase {
            id: id.clone(),
            name: name.to_string(),
            description,
            created_at: Utc::now(),
            config,
            generation: 0,
        };
        let handle = KbHandle::open(dir, kb.clone()).await?;
        self.handles.write().await.insert(id.clone(), Arc::new(handle));

        if let Some(supervisor) = self.tool_servers.read().await.clone() {
            if let Err(e) = supervisor
                .create(
                    ToolServerKind::Single,
                    vec![id.clone()],
                    kb.name.clone(),
                    String::new(),
                    HashMap::new(),
                    None,
                )
                .await
            {
                tracing::warn!(kb_id = %id, error = %e.message, "failed to create default tool server for new knowledge base");
            }
        }

        Ok(kb)
    }

    pub async fn get(&self, kb_id: &str) -> KResult<Arc<KbHandle>> {
        self.handles
            .read()
            .await
            .get(kb_id)
            .cloned()
            .ok_or_else(|| KError::not_found(format!("knowledge base not found: {kb_id}")))
    }

    pub async fn list(&self) -> Vec<KnowledgeBase> {
        let mut out = Vec::new();
        for handle in self.handles.read().await.values() {
            out.push(handle.kb.read().await.clone());
        }
        out
    }

    pub async fn rename(&self, kb_id: &str, new_name: &str) -> KResult<()> {
        let handle = self.get(kb_id).await?;
        let _write_guard = handle.write_lock.lock().await;
        handle.storage.rename_kb(new_name).await?;
        handle.kb.write().await.name = new_name.to_string();
        drop(_write_guard);

        if let Some(supervisor) = self.tool_servers.read().await.clone() {
            supervisor.on_kb_renamed(kb_id, new_name).await;
        }
        Ok(())
    }

    /// Delete a KB entirely: blobs, metadata, both indices, and the
    /// in-memory handle.
    pub async fn delete(&self, kb_id: &str) -> KResult<()> {
        let handle = {
            let mut handles = self.handles.write().await;
            handles
                .remove(kb_id)
                .ok_or_else(|| KError::not_found(format!("knowledge base not found: {kb_id}")))?
        };
        handle.storage.close().await;
        std::fs::remove_dir_all(&handle.dir)?;

        if let Some(supervisor) = self.tool_servers.read().await.clone() {
            supervisor.on_kb_deleted(kb_id).await?;
        }
        Ok(())
    }

    /// Update a KB's retrieval-only config fields immediately; if any
    /// reindex-requiring field changed, the caller is responsible for
    /// triggering a reindex afterward.
    pub async fn update_config(&self, kb_id: &str, new_config: KBConfig) -> KResult<bool> {
        new_config.validate()?;
        let handle = self.get(kb_id).await?;
        let _write_guard = handle.write_lock.lock().await;
        let (requires_reindex, bm25_changed) = {
            let kb = handle.kb.read().await;
            (
                kb.config.requires_reindex(&new_config),
                kb.config.bm25_k1 != new_config.bm25_k1 || kb.config.bm25_b != new_config.bm25_b,
            )
        };
        handle.storage.save_kb_config(&new_config).await?;
        if bm25_changed {
            handle
                .lexical_index
                .write()
                .await
                .set_params(new_config.bm25_k1, new_config.bm25_b)?;
        }
        handle.kb.write().await.config = new_config;
        Ok(requires_reindex)
    }

    /// Ingest one file into a KB, serialized behind the KB's write lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn ingest_file(
        &self,
        kb_id: &str,
        provider: &dyn EmbeddingProvider,
        settings: &EmbeddingSettings,
        ocr: &dyn OcrProvider,
        counter: &dyn crate::chunk::TokenCounter,
        filename: &str,
        bytes: Vec<u8>,
        reporter: Option<&dyn ProgressReporter>,
    ) -> KResult<ingest::IngestOutcome> {
        let handle = self.get(kb_id).await?;
        let _write_guard = handle.write_lock.lock().await;
        if handle.reindex_lock.is_held() {
            return Err(KError::conflict("knowledge base is reindexing; writes are rejected until it completes"));
        }
        let config = handle.kb.read().await.config.clone();
        let reporter = reporter.unwrap_or(&NoProgress);
        let mut vector_index = handle.vector_index.write().await;
        let mut lexical_index = handle.lexical_index.write().await;
        ingest::ingest_file(
            &handle.storage,
            &mut vector_index,
            &mut lexical_index,
            kb_id,
            &config,
            provider,
            settings,
            ocr,
            counter,
            filename,
            bytes,
            reporter,
        )
        .await
    }

    pub async fn delete_document(&self, kb_id: &str, document_id: &str) -> KResult<()> {
        let handle = self.get(kb_id).await?;
        let _write_guard = handle.write_lock.lock().await;
        if handle.reindex_lock.is_held() {
            return Err(KError::conflict("knowledge base is reindexing; writes are rejected until it completes"));
        }
        let mut vector_index = handle.vector_index.write().await;
        let mut lexical_index = handle.lexical_index.write().await;
        ingest::delete_document(&handle.storage, &mut vector_index, &mut lexical_index, document_id).await
    }

    pub async fn list_documents(&self, kb_id: &str) -> KResult<Vec<Document>> {
        let handle = self.get(kb_id).await?;
        handle.storage.list_documents().await
    }

    /// Run a query against a KB. Does not take the write lock: any number of
    /// queries may run concurrently, including while a reindex is underway
    /// (they observe the live indices until the reindex swap completes).
    pub async fn query(
        &self,
        kb_id: &str,
        query_vector: Option<&[f32]>,
        query_text: &str,
        k: usize,
    ) -> KResult<Vec<RetrievedChunk>> {
        let handle = self.get(kb_id).await?;
        let config = handle.kb.read().await.config.clone();
        let vector_index = handle.vector_index.read().await;
        let lexical_index = handle.lexical_index.read().await;
        retriever::retrieve(
            &handle.storage,
            &vector_index,
            &lexical_index,
            &config,
            query_vector,
            query_text,
            k,
        )
        .await
    }

    /// Reindex a KB under `new_config`, then atomically publish the shadow
    /// indices as live ones.
    #[allow(clippy::too_many_arguments)]
    pub async fn reindex(
        &self,
        kb_id: &str,
        new_config: KBConfig,
        provider: &dyn EmbeddingProvider,
        settings: &EmbeddingSettings,
        ocr: &dyn OcrProvider,
        counter: &dyn crate::chunk::TokenCounter,
        reporter: &dyn ProgressReporter,
    ) -> KResult<u64> {
        new_config.validate()?;
        let handle = self.get(kb_id).await?;
        let _write_guard = handle.write_lock.lock().await;

        // The shadow indices are already fully persisted under their
        // temporary filenames; drop the in-memory copies, rename on disk,
        // then reopen from the now-live paths so persistence targets are
        // correct going forward.
        let (_shadow_vector, _shadow_lexical, generation) = reindex::run_reindex(
            &handle.storage,
            &handle.reindex_lock,
            &handle.dir,
            kb_id,
            &new_config,
            provider,
            settings,
            ocr,
            counter,
            reporter,
        )
        .await?;

        {
            let mut vector_index = handle.vector_index.write().await;
            let mut lexical_index = handle.lexical_index.write().await;
            reindex::publish_shadow(&handle.dir)?;
            *vector_index = VectorIndex::open(&handle.dir.join("vector.idx"))?;
            *lexical_index = LexicalIndex::open(
                &handle.dir.join("lexical.idx"),
                new_config.bm25_k1,
                new_config.bm25_b,
            )?;
        }
        handle.kb.write().await.generation = generation;
        handle.kb.write().await.config = new_config;

        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::UnavailableOcr;
    use crate::models::DocStatus;
    use crate::progress::NoProgress;
    use async_trait::async_trait;

    /// Deterministic stand-in embedding provider: hashes each word into a
    /// fixed-width vector so semantically unrelated texts land far apart
    /// without depending on a real model or network access.
    struct FakeProvider {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        fn model_id(&self) -> &str {
            "fake"
        }
        fn dimension(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> KResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
        }
    }

    fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dims];
        for word in text.to_lowercase().split_whitespace() {
            let mut h: u64 = 1469598103934665603;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h as usize) % dims] += 1.0;
        }
        v
    }

    fn enabled_settings() -> EmbeddingSettings {
        EmbeddingSettings {
            provider: "fake".to_string(),
            ..EmbeddingSettings::default()
        }
    }

    async fn new_manager() -> (tempfile::TempDir, KnowledgeBaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = KnowledgeBaseManager::open(dir.path()).await.unwrap();
        (dir, manager)
    }

    // S1: upload a file, query an exact substring, expect it back ranked first.
    #[tokio::test]
    async fn scenario_upload_then_query_finds_exact_substring() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let provider = FakeProvider { dims: 32 };
        let settings = enabled_settings();
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;

        let outcome = manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "hello.txt",
                b"The quick brown fox jumps over the lazy dog.".to_vec(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.chunk_count, 1);

        let qv = hash_embed("lazy dog", 32);
        let results = manager
            .query(&kb.id, Some(qv.as_slice()), "lazy dog", 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_filename, "hello.txt");
        assert!(results[0].text.contains("lazy dog"));
        assert!(results[0].score > 0.0);
    }

    // S2: shrinking chunk_size_tokens and reindexing preserves searchability.
    #[tokio::test]
    async fn scenario_reindex_with_smaller_chunk_size_keeps_document_searchable() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let provider = FakeProvider { dims: 32 };
        let settings = enabled_settings();
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;
        let reporter = NoProgress;

        manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "hello.txt",
                b"The quick brown fox jumps over the lazy dog.".to_vec(),
                None,
            )
            .await
            .unwrap();

        let mut new_config = KBConfig::default();
        new_config.chunk_size_tokens = 100;
        let generation = manager
            .reindex(&kb.id, new_config, &provider, &settings, &ocr, &counter, &reporter)
            .await
            .unwrap();
        assert_eq!(generation, 1);

        let docs = manager.list_documents(&kb.id).await.unwrap();
        assert_eq!(docs.len(), 1);

        let qv = hash_embed("lazy dog", 32);
        let results = manager.query(&kb.id, Some(qv.as_slice()), "lazy dog", 5).await.unwrap();
        assert!(results.iter().any(|r| r.source_filename == "hello.txt"));
    }

    // S3: whitespace-only content ingests cleanly to zero chunks and never
    // appears in search results.
    #[tokio::test]
    async fn scenario_whitespace_only_document_has_zero_chunks_and_is_unsearchable() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let provider = FakeProvider { dims: 32 };
        let settings = enabled_settings();
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;

        let outcome = manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "blank.txt",
                b"   ".to_vec(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.chunk_count, 0);

        let docs = manager.list_documents(&kb.id).await.unwrap();
        assert_eq!(docs[0].status, DocStatus::Ready);

        let qv = hash_embed("anything", 32);
        let results = manager.query(&kb.id, Some(qv.as_slice()), "anything", 5).await.unwrap();
        assert!(results.is_empty());
    }

    // S6: a reindex already running rejects a concurrent one with `conflict`.
    #[tokio::test]
    async fn scenario_concurrent_reindex_is_rejected() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();
        let handle = manager.get(&kb.id).await.unwrap();
        let _guard = handle.reindex_lock.acquire().unwrap();

        let provider = FakeProvider { dims: 32 };
        let settings = enabled_settings();
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;
        let reporter = NoProgress;

        let err = manager
            .reindex(&kb.id, KBConfig::default(), &provider, &settings, &ocr, &counter, &reporter)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    // Query without an embedding vector falls back to lexical-only search
    // instead of returning nothing.
    #[tokio::test]
    async fn query_without_vector_falls_back_to_lexical_search() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let settings = EmbeddingSettings::default(); // provider = "disabled"
        let provider = crate::embedding::DisabledProvider;
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;

        manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "hello.txt",
                b"The quick brown fox jumps over the lazy dog.".to_vec(),
                None,
            )
            .await
            .unwrap();

        let results = manager.query(&kb.id, None, "lazy dog", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_filename, "hello.txt");
    }

    // Deleting a document removes it from search results entirely.
    #[tokio::test]
    async fn delete_document_removes_it_from_search() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let provider = FakeProvider { dims: 32 };
        let settings = enabled_settings();
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;

        let outcome = manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "hello.txt",
                b"The quick brown fox jumps over the lazy dog.".to_vec(),
                None,
            )
            .await
            .unwrap();

        manager.delete_document(&kb.id, &outcome.document_id).await.unwrap();

        let qv = hash_embed("lazy dog", 32);
        let results = manager.query(&kb.id, Some(qv.as_slice()), "lazy dog", 5).await.unwrap();
        assert!(results.is_empty());
    }

    // Changing bm25_k1/bm25_b through update_config must re-score the live
    // lexical index immediately, without a reindex.
    #[tokio::test]
    async fn update_config_applies_bm25_params_without_reindex() {
        let (_dir, manager) = new_manager().await;
        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let settings = EmbeddingSettings::default(); // provider = "disabled"
        let provider = crate::embedding::DisabledProvider;
        let ocr = UnavailableOcr;
        let counter = crate::chunk::CharHeuristicCounter;

        // Repeated terms so the term-frequency factor (which `k1` shapes)
        // is not degenerate at f=1, where it is always 1 regardless of k1.
        manager
            .ingest_file(
                &kb.id,
                &provider,
                &settings,
                &ocr,
                &counter,
                "hello.txt",
                b"lazy dog lazy dog lazy dog lazy dog fox.".to_vec(),
                None,
            )
            .await
            .unwrap();

        // Read the raw (pre-normalization) BM25 score directly from the
        // index: `retrieve()`'s min-max normalization would otherwise
        // collapse a single-hit result to 1.0 regardless of k1/b and hide
        // the effect being tested.
        let handle = manager.get(&kb.id).await.unwrap();
        let score_before = handle.lexical_index.read().await.search("lazy dog", 5)[0].score;

        let mut new_config = KBConfig::default();
        new_config.bm25_k1 = 10.0;
        new_config.bm25_b = 0.1;
        let requires_reindex = manager.update_config(&kb.id, new_config).await.unwrap();
        assert!(!requires_reindex);

        let score_after = handle.lexical_index.read().await.search("lazy dog", 5)[0].score;
        assert_ne!(score_before, score_after);
    }

    // Creating a KB with a supervisor attached creates a default single-KB
    // server in the stopped state; deleting the KB removes the server again
    // since it is left serving nothing.
    #[tokio::test]
    async fn create_and_delete_kb_propagate_to_tool_server_fleet() {
        let (dir, manager) = new_manager().await;
        let supervisor = std::sync::Arc::new(
            crate::tool_server::ToolServerSupervisor::open(dir.path(), 9300, 9400, EmbeddingSettings::default())
                .await
                .unwrap(),
        );
        manager.attach_tool_servers(supervisor.clone()).await;

        let kb = manager
            .create("kb1", None, KBConfig::default())
            .await
            .unwrap();

        let servers = supervisor.list().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].kb_ids, vec![kb.id.clone()]);
        assert!(matches!(servers[0].status, crate::models::ToolServerStatus::Stopped));

        manager.rename(&kb.id, "kb1-renamed").await.unwrap();
        assert_eq!(supervisor.list().await.len(), 1);

        manager.delete(&kb.id).await.unwrap();
        assert!(supervisor.list().await.is_empty());
    }
}
