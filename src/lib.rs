//! # kbase
//!
//! **A self-hosted knowledge-base platform: ingest documents, chunk and
//! embed them, and serve hybrid vector+keyword retrieval to AI tools over a
//! supervised per-knowledge-base subprocess.**
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌────────────────┐
//! │  Ingest   │──▶│  Chunk +   │──▶│  Storage   │   │  Vector Index   │
//! │  (files)  │   │  Embed     │   │ (SQLite)   │──▶│  Lexical Index  │
//! └───────────┘   └────────────┘   └───────────┘   └────────┬────────┘
//!                                                            │
//!                                        ┌───────────────────┤
//!                                        ▼                   ▼
//!                                  ┌──────────┐       ┌────────────┐
//!                                  │ kbasectl │       │ tool-server │
//!                                  │  (CLI)   │       │ (per KB)    │
//!                                  └──────────┘       └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`ingest`] writes the uploaded bytes to a content-addressed blob,
//!    detects its format, and drives it through extraction, chunking, and
//!    embedding.
//! 2. [`extract`] turns raw bytes into [`models::Document`]-scoped text
//!    [`extract::Segment`]s (plain text, PDF, DOCX/XLSX/PPTX, with OCR as a
//!    pluggable fallback for scanned pages).
//! 3. [`chunk`] splits segments into token-budgeted [`models::Chunk`]s on
//!    paragraph/sentence/word boundaries.
//! 4. [`embedding`] turns chunk text into L2-normalized vectors through a
//!    pluggable provider (OpenAI, Ollama, or disabled).
//! 5. [`storage`] persists documents and chunks in a per-KB SQLite database;
//!    [`vector_index`] and [`lexical_index`] persist the retrieval indices
//!    alongside it.
//! 6. [`retriever`] answers queries by fusing normalized vector and BM25
//!    scores; [`reindex`] rebuilds both indices from scratch into a shadow
//!    pair and atomically publishes them.
//! 7. [`kb_manager`] owns the per-KB concurrency model (a write lock
//!    serializing ingest/delete/reindex, lock-free queries) across every
//!    open knowledge base.
//! 8. [`tool_server`] supervises one subprocess per tool server, each
//!    exposing `search`/`info`/`list_documents` over the KBs it was told to
//!    serve; [`tool_server::runtime`] is what actually runs inside that
//!    subprocess.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Structured error type shared across the engine |
//! | [`models`] | Core data types: `KnowledgeBase`, `Document`, `Chunk`, `ToolServerRecord` |
//! | [`config`] | Instance-level configuration and data-root layout |
//! | [`chunk`] | Token-aware, boundary-preferring text chunker |
//! | [`extract`] | Multi-format text extraction (text/PDF/OOXML) with OCR fallback |
//! | [`embedding`] | Embedding provider trait, OpenAI/Ollama implementations, vector utilities |
//! | [`storage`] | Per-KB SQLite metadata store and blob storage |
//! | [`vector_index`] | Per-KB brute-force cosine similarity index |
//! | [`lexical_index`] | Per-KB BM25 index |
//! | [`retriever`] | Hybrid vector+lexical retrieval with score fusion |
//! | [`ingest`] | Ingestion pipeline: blob → extract → chunk → embed → commit |
//! | [`reindex`] | Shadow-index rebuild and atomic publish |
//! | [`progress`] | Ingest/reindex progress reporting |
//! | [`kb_manager`] | Knowledge-base lifecycle and concurrency control |
//! | [`tool_server`] | Tool-server supervisor and runtime |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod kb_manager;
pub mod lexical_index;
pub mod models;
pub mod progress;
pub mod reindex;
pub mod retriever;
pub mod storage;
pub mod tool_server;
pub mod vector_index;
