//! Storage layer: raw-blob storage plus the transactional metadata store
//! for one knowledge base's documents and chunks.
//!
//! Raw blobs live under `<kb_dir>/blobs/<doc-id>.<ext>`; metadata lives in
//! `<kb_dir>/meta.db` (SQLite, WAL mode, one pool per KB). `commit_document`
//! installs a document plus all of its chunks in a single transaction, or
//! none of it; `mark_failed` guarantees the opposite — no chunk or vector
//! row survives for a document that didn't make it to `ready`.

mod schema;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ErrorKind, KError, KResult};
use crate::models::{Chunk, DocStatus, Document, FormatTag, KBConfig, KnowledgeBase};

pub struct Storage {
    pool: SqlitePool,
    kb_dir: PathBuf,
}

impl Storage {
    /// Open (creating if necessary) the metadata store for a KB directory,
    /// running migrations and a best-effort self-heal pass ("storage
    /// corruption detected at open time triggers a best-effort self-heal").
    pub async fn open(kb_dir: &Path, kb: &KnowledgeBase) -> KResult<Self> {
        std::fs::create_dir_all(kb_dir)?;
        std::fs::create_dir_all(kb_dir.join("blobs"))?;

        let db_path = kb_dir.join("meta.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(|e| KError::new(ErrorKind::StorageFailed, e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        schema::run_migrations(&pool).await?;

        let storage = Self {
            pool,
            kb_dir: kb_dir.to_path_buf(),
        };
        storage.ensure_kb_info(kb).await?;
        storage.self_heal().await?;
        Ok(storage)
    }

    async fn ensure_kb_info(&self, kb: &KnowledgeBase) -> KResult<()> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM kb_info WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_none() {
            let config_json = serde_json::to_string(&kb.config)
                .map_err(|e| KError::internal(e.to_string()))?;
            sqlx::query(
                "INSERT INTO kb_info (id, kb_id, name, description, created_at, config_json, generation) VALUES (0, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&kb.id)
            .bind(&kb.name)
            .bind(&kb.description)
            .bind(kb.created_at.to_rfc3339())
            .bind(config_json)
            .bind(kb.generation as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Discard rows/blobs left behind by a crash mid-ingestion: documents
    /// that never reached `ready` or `failed` have no committed chunks to
    /// speak of and are removed outright.
    async fn self_heal(&self) -> KResult<()> {
        let stuck: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE status IN ('pending', 'extracting', 'embedding')",
        )
        .fetch_all(&self.pool)
        .await?;

        for doc_id in stuck {
            tracing::warn!(document_id = %doc_id, "self-heal: discarding document stuck mid-ingestion");
            self.purge_document_rows(&doc_id).await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(&doc_id)
                .execute(&self.pool)
                .await?;
        }

        // Orphaned blobs: files under blobs/ with no matching document row.
        let blobs_dir = self.kb_dir.join("blobs");
        if let Ok(entries) = std::fs::read_dir(&blobs_dir) {
            let known: Vec<String> = sqlx::query_scalar("SELECT stored_path FROM documents")
                .fetch_all(&self.pool)
                .await?;
            for entry in entries.flatten() {
                let rel = format!("blobs/{}", entry.file_name().to_string_lossy());
                if !known.iter().any(|k| k == &rel) {
                    tracing::warn!(path = %rel, "self-heal: removing orphaned blob");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn blob_path(&self, stored_path: &str) -> PathBuf {
        self.kb_dir.join(stored_path)
    }

    /// Write a document's raw bytes under `blobs/<doc-id>.<ext>` and return
    /// the stored path, relative to the KB directory.
    pub fn put_blob(&self, doc_id: &str, extension: &str, bytes: &[u8]) -> KResult<String> {
        let ext = if extension.is_empty() {
            "bin".to_string()
        } else {
            extension.to_string()
        };
        let rel = format!("blobs/{doc_id}.{ext}");
        let full = self.blob_path(&rel);
        std::fs::write(&full, bytes)?;
        Ok(rel)
    }

    pub fn open_blob(&self, stored_path: &str) -> KResult<Vec<u8>> {
        std::fs::read(self.blob_path(stored_path)).map_err(KError::from)
    }

    pub fn delete_blob(&self, stored_path: &str) -> KResult<()> {
        let path = self.blob_path(stored_path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Create the pending document row the pipeline tracks while it works.
    pub async fn create_pending(&self, doc: &Document) -> KResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, kb_id, filename, stored_path, format, byte_size, ingested_at, chunk_count, status, status_reason, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'pending', NULL, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.kb_id)
        .bind(&doc.filename)
        .bind(&doc.stored_path)
        .bind(doc.format.as_str())
        .bind(doc.byte_size as i64)
        .bind(doc.ingested_at.to_rfc3339())
        .bind(&doc.content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, doc_id: &str, status: &DocStatus) -> KResult<()> {
        let (label, reason) = status_parts(status);
        sqlx::query("UPDATE documents SET status = ?, status_reason = ? WHERE id = ?")
            .bind(label)
            .bind(reason)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove any chunk rows for a document (used before a fresh commit and
    /// on failure) so retries and reprocessing never leave stale chunks.
    async fn purge_document_rows(&self, doc_id: &str) -> KResult<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically install a document's chunks and mark it `ready`. Chunks
    /// are first deleted (supporting reprocess/idempotent re-ingest) then
    /// reinserted inside one transaction.
    pub async fn commit_document(&self, doc_id: &str, chunks: &[Chunk]) -> KResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, kb_id, sequence_index, text, token_count, page, paragraph, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.kb_id)
            .bind(chunk.sequence_index as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(chunk.page)
            .bind(chunk.paragraph)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE documents SET status = 'ready', status_reason = NULL, chunk_count = ? WHERE id = ?")
            .bind(chunks.len() as i64)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a document `failed`, guaranteeing no chunk rows remain for it.
    pub async fn mark_failed(&self, doc_id: &str, reason: &str) -> KResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE documents SET status = 'failed', status_reason = ?, chunk_count = 0 WHERE id = ?")
            .bind(reason)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_document(&self, doc_id: &str) -> KResult<()> {
        if let Some(doc) = self.get_document(doc_id).await? {
            self.delete_blob(&doc.stored_path)?;
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_document(&self, doc_id: &str) -> KResult<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_document(&r)))
    }

    pub async fn list_documents(&self) -> KResult<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY ingested_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    pub async fn find_document_by_content_hash(&self, hash: &str) -> KResult<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE content_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_document(&r)))
    }

    pub async fn list_chunks_for_document(&self, doc_id: &str) -> KResult<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY sequence_index ASC")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn all_chunks(&self) -> KResult<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks ORDER BY document_id, sequence_index ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> KResult<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_chunk(&r)))
    }

    /// Read back the KB's persisted identity row, used when reattaching to
    /// an existing on-disk KB at startup.
    pub async fn load_kb_identity(&self) -> KResult<KnowledgeBase> {
        let row = sqlx::query("SELECT * FROM kb_info WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        let created_at: String = row.get("created_at");
        let config_json: String = row.get("config_json");
        Ok(KnowledgeBase {
            id: row.get("kb_id"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            config: serde_json::from_str(&config_json).map_err(|e| KError::internal(e.to_string()))?,
            generation: row.get::<i64, _>("generation") as u64,
        })
    }

    pub async fn load_kb_config(&self) -> KResult<KBConfig> {
        let json: String = sqlx::query_scalar("SELECT config_json FROM kb_info WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        serde_json::from_str(&json).map_err(|e| KError::internal(e.to_string()))
    }

    pub async fn save_kb_config(&self, config: &KBConfig) -> KResult<()> {
        let json = serde_json::to_string(config).map_err(|e| KError::internal(e.to_string()))?;
        sqlx::query("UPDATE kb_info SET config_json = ? WHERE id = 0")
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_generation(&self) -> KResult<u64> {
        sqlx::query("UPDATE kb_info SET generation = generation + 1 WHERE id = 0")
            .execute(&self.pool)
            .await?;
        let gen: i64 = sqlx::query_scalar("SELECT generation FROM kb_info WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(gen as u64)
    }

    pub async fn rename_kb(&self, new_name: &str) -> KResult<()> {
        sqlx::query("UPDATE kb_info SET name = ? WHERE id = 0")
            .bind(new_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn status_parts(status: &DocStatus) -> (&'static str, Option<String>) {
    match status {
        DocStatus::Pending => ("pending", None),
        DocStatus::Extracting => ("extracting", None),
        DocStatus::Embedding => ("embedding", None),
        DocStatus::Ready => ("ready", None),
        DocStatus::Failed { reason } => ("failed", Some(reason.clone())),
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status_label: String = row.get("status");
    let status_reason: Option<String> = row.get("status_reason");
    let status = match status_label.as_str() {
        "pending" => DocStatus::Pending,
        "extracting" => DocStatus::Extracting,
        "embedding" => DocStatus::Embedding,
        "ready" => DocStatus::Ready,
        _ => DocStatus::Failed {
            reason: status_reason.unwrap_or_default(),
        },
    };
    let format_label: String = row.get("format");
    let format = match format_label.as_str() {
        "text" => FormatTag::Text,
        "pdf" => FormatTag::Pdf,
        "docx" => FormatTag::Docx,
        "image" => FormatTag::Image,
        _ => FormatTag::Other,
    };
    let ingested_at: String = row.get("ingested_at");

    Document {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        filename: row.get("filename"),
        stored_path: row.get("stored_path"),
        format,
        byte_size: row.get::<i64, _>("byte_size") as u64,
        ingested_at: chrono::DateTime::parse_from_rfc3339(&ingested_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        chunk_count: row.get::<i64, _>("chunk_count") as usize,
        status,
        content_hash: row.get("content_hash"),
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        kb_id: row.get("kb_id"),
        sequence_index: row.get::<i64, _>("sequence_index") as usize,
        text: row.get("text"),
        token_count: row.get::<i64, _>("token_count") as usize,
        page: row.get::<Option<i64>, _>("page").map(|v| v as u32),
        paragraph: row.get::<Option<i64>, _>("paragraph").map(|v| v as u32),
        hash: row.get("hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KBConfig;
    use uuid::Uuid;

    fn new_kb() -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4().to_string(),
            name: "test".to_string(),
            description: None,
            created_at: Utc::now(),
            config: KBConfig::default(),
            generation: 0,
        }
    }

    #[tokio::test]
    async fn put_and_open_blob_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let kb = new_kb();
        let storage = Storage::open(dir.path(), &kb).await.unwrap();
        let path = storage.put_blob("doc1", "txt", b"hello").unwrap();
        assert_eq!(storage.open_blob(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn commit_then_fetch_document_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let kb = new_kb();
        let storage = Storage::open(dir.path(), &kb).await.unwrap();

        let doc = Document {
            id: "doc1".to_string(),
            kb_id: kb.id.clone(),
            filename: "a.txt".to_string(),
            stored_path: "blobs/doc1.txt".to_string(),
            format: FormatTag::Text,
            byte_size: 5,
            ingested_at: Utc::now(),
            chunk_count: 0,
            status: DocStatus::Pending,
            content_hash: "abc".to_string(),
        };
        storage.create_pending(&doc).await.unwrap();

        let chunk = Chunk {
            id: "c1".to_string(),
            document_id: "doc1".to_string(),
            kb_id: kb.id.clone(),
            sequence_index: 0,
            text: "hello".to_string(),
            token_count: 1,
            page: None,
            paragraph: None,
            hash: "h".to_string(),
        };
        storage.commit_document("doc1", &[chunk]).await.unwrap();

        let fetched = storage.get_document("doc1").await.unwrap().unwrap();
        assert_eq!(fetched.status, DocStatus::Ready);
        assert_eq!(fetched.chunk_count, 1);
        let chunks = storage.list_chunks_for_document("doc1").await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn mark_failed_leaves_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let kb = new_kb();
        let storage = Storage::open(dir.path(), &kb).await.unwrap();
        let doc = Document {
            id: "doc1".to_string(),
            kb_id: kb.id.clone(),
            filename: "a.txt".to_string(),
            stored_path: "blobs/doc1.txt".to_string(),
            format: FormatTag::Text,
            byte_size: 5,
            ingested_at: Utc::now(),
            chunk_count: 0,
            status: DocStatus::Pending,
            content_hash: "abc".to_string(),
        };
        storage.create_pending(&doc).await.unwrap();
        storage.mark_failed("doc1", "boom").await.unwrap();

        let fetched = storage.get_document("doc1").await.unwrap().unwrap();
        assert!(matches!(fetched.status, DocStatus::Failed { .. }));
        let chunks = storage.list_chunks_for_document("doc1").await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn self_heal_discards_documents_stuck_mid_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let kb = new_kb();
        {
            let storage = Storage::open(dir.path(), &kb).await.unwrap();
            let doc = Document {
                id: "doc1".to_string(),
                kb_id: kb.id.clone(),
                filename: "a.txt".to_string(),
                stored_path: "blobs/doc1.txt".to_string(),
                format: FormatTag::Text,
                byte_size: 5,
                ingested_at: Utc::now(),
                chunk_count: 0,
                status: DocStatus::Pending,
                content_hash: "abc".to_string(),
            };
            storage.create_pending(&doc).await.unwrap();
            storage.close().await;
        }
        let storage = Storage::open(dir.path(), &kb).await.unwrap();
        assert!(storage.get_document("doc1").await.unwrap().is_none());
    }
}
