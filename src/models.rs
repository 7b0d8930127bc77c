//! Core data model: knowledge bases, documents, chunks, vector rows and
//! tool-server records. These mirror the persisted shapes in each KB's
//! `meta.db` and the instance-wide `tool-servers.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Detected document format. `Other` covers anything not in the supported
/// extraction set (still stored, never chunked into anything but raw text).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatTag {
    Text,
    Pdf,
    Docx,
    Image,
    Other,
}

impl FormatTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::Text => "text",
            FormatTag::Pdf => "pdf",
            FormatTag::Docx => "docx",
            FormatTag::Image => "image",
            FormatTag::Other => "other",
        }
    }
}

/// Document processing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DocStatus {
    Pending,
    Extracting,
    Embedding,
    Ready,
    Failed { reason: String },
}

impl DocStatus {
    pub fn as_label(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Extracting => "extracting",
            DocStatus::Embedding => "embedding",
            DocStatus::Ready => "ready",
            DocStatus::Failed { .. } => "failed",
        }
    }
}

/// Per-knowledge-base configuration. Fields in the first group affect chunk
/// content or embeddings and require a full reindex when changed; fields in
/// the second group are retrieval-only and apply immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KBConfig {
    // --- reindex-requiring ---
    pub embedding_model: String,
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub overlap_enabled: bool,
    // --- retrieval-only, apply immediately ---
    pub hybrid_enabled: bool,
    pub vector_weight_alpha: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for KBConfig {
    fn default() -> Self {
        Self {
            embedding_model: "disabled".to_string(),
            chunk_size_tokens: 500,
            chunk_overlap_tokens: 0,
            overlap_enabled: false,
            hybrid_enabled: true,
            vector_weight_alpha: 0.6,
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

impl KBConfig {
    /// Fields that, if changed relative to `other`, invalidate existing
    /// embeddings and require a full reindex.
    pub fn requires_reindex(&self, other: &KBConfig) -> bool {
        self.embedding_model != other.embedding_model
            || self.chunk_size_tokens != other.chunk_size_tokens
            || self.chunk_overlap_tokens != other.chunk_overlap_tokens
            || self.overlap_enabled != other.overlap_enabled
    }

    pub fn validate(&self) -> Result<(), crate::error::KError> {
        use crate::error::KError;
        if self.chunk_size_tokens == 0 {
            return Err(KError::invalid_input("chunk_size_tokens must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.vector_weight_alpha) {
            return Err(KError::invalid_input("vector_weight_alpha must be in [0,1]"));
        }
        if self.bm25_k1 < 0.0 {
            return Err(KError::invalid_input("bm25_k1 must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(KError::invalid_input("bm25_b must be in [0,1]"));
        }
        Ok(())
    }
}

/// A logically isolated collection of documents plus its own indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub config: KBConfig,
    /// Incremented on every successful reindex.
    pub generation: u64,
}

/// A document owned by a KB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub filename: String,
    /// Path of the stored blob, relative to the KB's `blobs/` directory.
    pub stored_path: String,
    pub format: FormatTag,
    pub byte_size: u64,
    pub ingested_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub status: DocStatus,
    /// Content-addressed hash of the raw bytes, used for dedup / idempotent reprocess.
    pub content_hash: String,
}

/// A chunk of extracted text, the unit of embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub kb_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub token_count: usize,
    pub page: Option<u32>,
    pub paragraph: Option<u32>,
    pub hash: String,
}

/// A dense embedding for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRow {
    pub chunk_id: String,
    pub document_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
}

/// Kind of tool server: single-KB or multi-KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolServerKind {
    Single,
    Multi,
}

/// Runtime status of a tool-server subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Per-tool description + parameter-description overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    pub description: Option<String>,
    #[serde(default)]
    pub parameter_descriptions: HashMap<String, String>,
}

/// A tool server: a supervised subprocess exposing `search`/`info`/`list_documents`
/// over one or more knowledge bases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerRecord {
    pub id: String,
    pub kind: ToolServerKind,
    pub name: String,
    pub instructions: String,
    pub port: u16,
    pub enabled: bool,
    pub kb_ids: Vec<String>,
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,
    pub status: ToolServerStatus,
    pub last_error: Option<String>,
    /// Consecutive crash count within the current restart window, reset on
    /// a clean `running` transition or once the window expires.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_restart_window_start: Option<DateTime<Utc>>,
}

impl ToolServerRecord {
    pub fn source_label(&self) -> String {
        format!("tool-server:{}", self.name)
    }
}
