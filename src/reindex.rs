//! Reindex controller: rebuild a KB's vector and lexical indices into a
//! shadow pair under temporary names, then atomically swap them in.
//!
//! Only one reindex runs per KB at a time (`reindex_lock`, rejected rather
//! than queued if already held). Writes (new uploads) during a reindex are
//! likewise rejected rather than queued, to avoid the extra bookkeeping a
//! write queue would need for something that reindexing a KB with an ingest
//! workflow concurrently already discourages in practice.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::chunk::{chunk_segments, ChunkParams, TokenCounter};
use crate::embedding::{embed_batched, EmbeddingProvider, EmbeddingSettings};
use crate::error::{ErrorKind, KError, KResult};
use crate::extract::{self, OcrProvider};
use crate::lexical_index::LexicalIndex;
use crate::models::KBConfig;
use crate::progress::{ProgressReporter, ReindexProgress};
use crate::storage::Storage;
use crate::vector_index::VectorIndex;

/// Guards a KB against concurrent reindexes. One instance lives per KB,
/// owned by the KB manager alongside its storage and indices.
#[derive(Default)]
pub struct ReindexLock(AtomicBool);

impl ReindexLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) -> KResult<ReindexGuard<'_>> {
        if self
            .0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KError::conflict("a reindex is already running for this KB"));
        }
        Ok(ReindexGuard(&self.0))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct ReindexGuard<'a>(&'a AtomicBool);

impl Drop for ReindexGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Rebuild a KB's indices from its stored blobs under the new config, then
/// atomically swap them in. On any error, the shadow files are discarded and
/// the live indices are left untouched.
#[allow(clippy::too_many_arguments)]
pub async fn run_reindex(
    storage: &Storage,
    lock: &ReindexLock,
    kb_dir: &Path,
    kb_id: &str,
    new_config: &KBConfig,
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingSettings,
    ocr: &dyn OcrProvider,
    counter: &dyn TokenCounter,
    reporter: &dyn ProgressReporter,
) -> KResult<(VectorIndex, LexicalIndex, u64)> {
    let _guard = lock.acquire()?;

    let documents = storage.list_documents().await?;
    let total = documents.len();
    let mut progress = ReindexProgress::started(total);
    reporter.report_reindex(&progress);

    let shadow_vector_path = kb_dir.join("vector.idx.shadow");
    let shadow_lexical_path = kb_dir.join("lexical.idx.shadow");
    let _ = std::fs::remove_file(&shadow_vector_path);
    let _ = std::fs::remove_file(&shadow_lexical_path);

    let mut shadow_vector = VectorIndex::open(&shadow_vector_path)?;
    let mut shadow_lexical =
        LexicalIndex::open(&shadow_lexical_path, new_config.bm25_k1, new_config.bm25_b)?;

    let params = ChunkParams {
        max_tokens: new_config.chunk_size_tokens,
        overlap_tokens: new_config.chunk_overlap_tokens,
        overlap_enabled: new_config.overlap_enabled,
    };

    for document in &documents {
        progress.current_file = Some(document.filename.clone());
        progress.current_file_progress = 0.0;
        reporter.report_reindex(&progress);

        match reindex_one(
            storage,
            &mut shadow_vector,
            &mut shadow_lexical,
            kb_id,
            &params,
            provider,
            settings,
            ocr,
            counter,
            &document.id,
            &document.stored_path,
        )
        .await
        {
            Ok(()) => progress.succeeded += 1,
            Err(e) => {
                tracing::warn!(document_id = %document.id, error = %e.message, "reindex: document failed, continuing");
                progress.failed += 1;
            }
        }

        progress.processed += 1;
        progress.current_file_progress = 1.0;
        progress.percent = if total == 0 {
            100.0
        } else {
            (progress.processed as f32 / total as f32) * 100.0
        };
        reporter.report_reindex(&progress);
    }

    let generation = storage.bump_generation().await?;
    storage.save_kb_config(new_config).await?;

    Ok((shadow_vector, shadow_lexical, generation))
}

#[allow(clippy::too_many_arguments)]
async fn reindex_one(
    storage: &Storage,
    shadow_vector: &mut VectorIndex,
    shadow_lexical: &mut LexicalIndex,
    kb_id: &str,
    params: &ChunkParams,
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingSettings,
    ocr: &dyn OcrProvider,
    counter: &dyn TokenCounter,
    document_id: &str,
    stored_path: &str,
) -> KResult<()> {
    let bytes = storage.open_blob(stored_path)?;
    let filename = stored_path.rsplit('/').next().unwrap_or(stored_path);
    let segments = extract::extract(&bytes, filename, ocr)?;
    let chunks = chunk_segments(document_id, kb_id, &segments, *params, counter);

    if chunks.is_empty() {
        storage.commit_document(document_id, &chunks).await?;
        return Ok(());
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = if settings.is_enabled() {
        embed_batched(provider, settings, &texts).await?
    } else {
        Vec::new()
    };

    if settings.is_enabled() && vectors.len() != chunks.len() {
        return Err(KError::new(
            ErrorKind::EmbeddingFailed,
            "embedding provider returned a different number of vectors than chunks",
        ));
    }

    storage.commit_document(document_id, &chunks).await?;

    if settings.is_enabled() {
        let rows: Vec<(String, String, Vec<f32>)> = chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(c, v)| (c.id.clone(), c.document_id.clone(), v))
            .collect();
        shadow_vector.add_batch(&rows)?;
    }

    let lexical_rows: Vec<(String, String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), c.document_id.clone(), c.text.clone()))
        .collect();
    shadow_lexical.add_batch(&lexical_rows)?;

    Ok(())
}

/// Publish the shadow indices as the live ones. Call after
/// dropping any in-memory `VectorIndex`/`LexicalIndex` handles that point at
/// the shadow files but before constructing fresh ones for the new live
/// files.
pub fn publish_shadow(kb_dir: &Path) -> KResult<()> {
    let vector_shadow = kb_dir.join("vector.idx.shadow");
    let lexical_shadow = kb_dir.join("lexical.idx.shadow");
    let vector_live = kb_dir.join("vector.idx");
    let lexical_live = kb_dir.join("lexical.idx");

    VectorIndex::rename(&vector_shadow, &vector_live)?;
    LexicalIndex::rename(&lexical_shadow, &lexical_live)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_rejects_concurrent_acquire() {
        let lock = ReindexLock::new();
        let guard = lock.acquire().unwrap();
        assert!(lock.acquire().is_err());
        drop(guard);
        assert!(lock.acquire().is_ok());
    }
}
