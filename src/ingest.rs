//! Ingestion pipeline: write blob → extract → chunk → embed (batched) →
//! commit chunks + vectors + lexical postings.
//!
//! Each stage updates the document's status for external visibility; on any
//! failure the document is marked `failed{reason}` with no partial chunk or
//! vector state left behind.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::chunk::{chunk_segments, ChunkParams, TokenCounter};
use crate::embedding::{embed_batched, EmbeddingProvider, EmbeddingSettings};
use crate::error::{ErrorKind, KError, KResult};
use crate::extract::{self, OcrProvider};
use crate::lexical_index::LexicalIndex;
use crate::models::{DocStatus, Document, KBConfig};
use crate::progress::{IngestEvent, ProgressReporter};
use crate::storage::Storage;
use crate::vector_index::VectorIndex;

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Outcome of ingesting a single file.
pub struct IngestOutcome {
    pub document_id: String,
    pub chunk_count: usize,
}

/// Ingest one file into a KB. Returns the committed document on success, or
/// an error after the document has been marked `failed` with a reason.
#[allow(clippy::too_many_arguments)]
pub async fn ingest_file(
    storage: &Storage,
    vector_index: &mut VectorIndex,
    lexical_index: &mut LexicalIndex,
    kb_id: &str,
    kb_config: &KBConfig,
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingSettings,
    ocr: &dyn OcrProvider,
    counter: &dyn TokenCounter,
    filename: &str,
    bytes: Vec<u8>,
    reporter: &dyn ProgressReporter,
) -> KResult<IngestOutcome> {
    let hash = content_hash(&bytes);
    if let Some(existing) = storage.find_document_by_content_hash(&hash).await? {
        if matches!(existing.status, DocStatus::Ready) {
            return Ok(IngestOutcome {
                document_id: existing.id,
                chunk_count: existing.chunk_count,
            });
        }
    }

    let document_id = Uuid::new_v4().to_string();
    let format = extract::detect_format(&bytes, filename);
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let stored_path = storage.put_blob(&document_id, extension, &bytes)?;

    let document = Document {
        id: document_id.clone(),
        kb_id: kb_id.to_string(),
        filename: filename.to_string(),
        stored_path,
        format,
        byte_size: bytes.len() as u64,
        ingested_at: Utc::now(),
        chunk_count: 0,
        status: DocStatus::Pending,
        content_hash: hash,
    };
    storage.create_pending(&document).await?;

    match run_pipeline(
        storage,
        vector_index,
        lexical_index,
        kb_id,
        kb_config,
        provider,
        settings,
        ocr,
        counter,
        &document_id,
        &bytes,
        filename,
        reporter,
    )
    .await
    {
        Ok(chunk_count) => Ok(IngestOutcome {
            document_id,
            chunk_count,
        }),
        Err(e) => {
            storage.mark_failed(&document_id, &e.message).await?;
            vector_index.delete_by_document(&document_id)?;
            lexical_index.delete_by_document(&document_id)?;
            reporter.report_ingest(IngestEvent::Failed {
                document: filename.to_string(),
                reason: e.message.clone(),
            });
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    storage: &Storage,
    vector_index: &mut VectorIndex,
    lexical_index: &mut LexicalIndex,
    kb_id: &str,
    kb_config: &KBConfig,
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingSettings,
    ocr: &dyn OcrProvider,
    counter: &dyn TokenCounter,
    document_id: &str,
    bytes: &[u8],
    filename: &str,
    reporter: &dyn ProgressReporter,
) -> KResult<usize> {
    storage
        .set_status(document_id, &DocStatus::Extracting)
        .await?;
    reporter.report_ingest(IngestEvent::Extracting {
        document: filename.to_string(),
    });

    let segments = extract::extract(bytes, filename, ocr)?;

    let params = ChunkParams {
        max_tokens: kb_config.chunk_size_tokens,
        overlap_tokens: kb_config.chunk_overlap_tokens,
        overlap_enabled: kb_config.overlap_enabled,
    };
    let chunks = chunk_segments(document_id, kb_id, &segments, params, counter);

    if chunks.is_empty() {
        storage.commit_document(document_id, &chunks).await?;
        return Ok(0);
    }

    storage
        .set_status(document_id, &DocStatus::Embedding)
        .await?;
    reporter.report_ingest(IngestEvent::Embedding {
        document: filename.to_string(),
        chunks: chunks.len(),
    });

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
        vector_index.add_batch(&rows)?;
    }

    let lexical_rows: Vec<(String, String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), c.document_id.clone(), c.text.clone()))
        .collect();
    lexical_index.add_batch(&lexical_rows)?;

    reporter.report_ingest(IngestEvent::Completed {
        document: filename.to_string(),
        chunks: chunks.len(),
    });

    Ok(chunks.len())
}

/// Delete a document and all of its dependent state: blob, metadata rows,
/// and entries in both indices.
pub async fn delete_document(
    storage: &Storage,
    vector_index: &mut VectorIndex,
    lexical_index: &mut LexicalIndex,
    document_id: &str,
) -> KResult<()> {
    storage.delete_document(document_id).await?;
    vector_index.delete_by_document(document_id)?;
    lexical_index.delete_by_document(document_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }
}
