//! Tool-server runtime: the process spawned per tool server. Exposes
//! `search`, `info`, and `list_documents` over JSON-over-HTTP and calls the
//! hybrid retriever in-process against the knowledge bases it was told to
//! serve.
//!
//! Configuration (KB ids, name, instructions, overrides, port) is read from
//! environment variables the supervisor sets before spawning the child —
//! simpler to pass through a subprocess boundary than argv for a variable
//! number of KB ids and a nested overrides map.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::embedding::{self, EmbeddingProvider, EmbeddingSettings};
use crate::extract::{OcrProvider, UnavailableOcr};
use crate::kb_manager::KnowledgeBaseManager;
use crate::models::ToolOverride;

pub const ENV_DATA_ROOT: &str = "KBASE_DATA_ROOT";
pub const ENV_KB_IDS: &str = "KBASE_KB_IDS";
pub const ENV_NAME: &str = "KBASE_SERVER_NAME";
pub const ENV_INSTRUCTIONS: &str = "KBASE_SERVER_INSTRUCTIONS";
pub const ENV_OVERRIDES: &str = "KBASE_TOOL_OVERRIDES";
pub const ENV_PORT: &str = "KBASE_PORT";

struct AppState {
    manager: KnowledgeBaseManager,
    provider: Box<dyn EmbeddingProvider>,
    settings: EmbeddingSettings,
    ocr: Box<dyn OcrProvider>,
    kb_ids: Vec<String>,
    name: String,
    instructions: String,
    overrides: HashMap<String, ToolOverride>,
}

type SharedState = Arc<AppState>;

/// Runtime configuration read from the environment at startup.
pub struct RuntimeConfig {
    pub data_root: std::path::PathBuf,
    pub kb_ids: Vec<String>,
    pub name: String,
    pub instructions: String,
    pub overrides: HashMap<String, ToolOverride>,
    pub port: u16,
    pub embedding: EmbeddingSettings,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, String> {
        let data_root = std::env::var(ENV_DATA_ROOT)
            .map_err(|_| format!("{ENV_DATA_ROOT} not set"))?
            .into();
        let kb_ids: Vec<String> = std::env::var(ENV_KB_IDS)
            .map_err(|_| format!("{ENV_KB_IDS} not set"))?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        let name = std::env::var(ENV_NAME).unwrap_or_else(|_| "knowledge-base".to_string());
        let instructions = std::env::var(ENV_INSTRUCTIONS).unwrap_or_default();
        let overrides = std::env::var(ENV_OVERRIDES)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let port: u16 = std::env::var(ENV_PORT)
            .map_err(|_| format!("{ENV_PORT} not set"))?
            .parse()
            .map_err(|_| format!("{ENV_PORT} is not a valid port"))?;
        let embedding = std::env::var("KBASE_EMBEDDING_SETTINGS")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(Self {
            data_root,
            kb_ids,
            name,
            instructions,
            overrides,
            port,
            embedding,
        })
    }
}

pub async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let port = config.port;
    let manager = KnowledgeBaseManager::open(&config.data_root).await?;
    let provider = embedding::create_provider(&config.embedding)?;

    let state: SharedState = Arc::new(AppState {
        manager,
        provider,
        settings: config.embedding,
        ocr: Box::new(UnavailableOcr),
        kb_ids: config.kb_ids,
        name: config.name,
        instructions: config.instructions,
        overrides: config.overrides,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/search", post(handle_search))
        .route("/tools/info", get(handle_info))
        .route("/tools/list_documents", post(handle_list_documents))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = format!("127.0.0.1:{port}");
    tracing::info!(addr = %bind_addr, "tool-server runtime listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

fn resolve_kb<'a>(state: &'a AppState, requested: &'a Option<String>) -> Result<&'a str, AppError> {
    match requested {
        Some(id) if state.kb_ids.iter().any(|k| k == id) => Ok(id.as_str()),
        Some(id) => Err(bad_request(format!("kb_id {id} is not served by this tool server"))),
        None if state.kb_ids.len() == 1 => Ok(state.kb_ids[0].as_str()),
        None => Err(bad_request("kb_id is required for a multi-knowledge-base server")),
    }
}

// ============ POST /tools/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    kb_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Serialize)]
struct SearchResultItem {
    chunk_id: String,
    document_id: String,
    source_filename: String,
    format: String,
    score: f32,
    sequence_index: usize,
    text: String,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

async fn handle_search(
    State(state): State<SharedState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let kb_id = resolve_kb(&state, &req.kb_id)?;

    let query_vector = if state.settings.is_enabled() {
        let vectors = embedding::embed_batched(state.provider.as_ref(), &state.settings, &[req.query.clone()])
            .await
            .map_err(|e| internal_error(e.message))?;
        vectors.into_iter().next()
    } else {
        None
    };

    let results = state
        .manager
        .query(kb_id, query_vector.as_deref(), &req.query, req.limit)
        .await
        .map_err(|e| internal_error(e.message))?;

    Ok(Json(SearchResponse {
        results: results
            .into_iter()
            .map(|r| SearchResultItem {
                chunk_id: r.chunk_id,
                document_id: r.document_id,
                source_filename: r.source_filename,
                format: r.format.as_str().to_string(),
                score: r.score,
                sequence_index: r.sequence_index,
                text: r.text,
            })
            .collect(),
    }))
}

// ============ GET /tools/info ============

#[derive(Serialize)]
struct InfoResponse {
    name: String,
    instructions: String,
    kb_ids: Vec<String>,
    knowledge_bases: Vec<KbSummary>,
    tools: Vec<ToolDescription>,
}

#[derive(Serialize)]
struct KbSummary {
    kb_id: String,
    name: String,
    document_count: usize,
    chunk_count: usize,
}

#[derive(Serialize)]
struct ToolDescription {
    name: String,
    description: String,
}

const DEFAULT_SEARCH_DESCRIPTION: &str = "Search the knowledge base for chunks relevant to a query.";
const DEFAULT_INFO_DESCRIPTION: &str = "Describe this tool server and the knowledge bases it serves.";
const DEFAULT_LIST_DOCUMENTS_DESCRIPTION: &str = "List the documents ingested into the knowledge base.";

async fn handle_info(State(state): State<SharedState>) -> Result<Json<InfoResponse>, AppError> {
    let tool_description = |tool: &str, default: &str| {
        state
            .overrides
            .get(tool)
            .and_then(|o| o.description.clone())
            .unwrap_or_else(|| default.to_string())
    };

    let mut knowledge_bases = Vec::with_capacity(state.kb_ids.len());
    for kb_id in &state.kb_ids {
        let handle = state
            .manager
            .get(kb_id)
            .await
            .map_err(|e| internal_error(e.message))?;
        let name = handle.kb.read().await.name.clone();
        let documents = state
            .manager
            .list_documents(kb_id)
            .await
            .map_err(|e| internal_error(e.message))?;
        let chunk_count = documents.iter().map(|d| d.chunk_count).sum();
        knowledge_bases.push(KbSummary {
            kb_id: kb_id.clone(),
            name,
            document_count: documents.len(),
            chunk_count,
        });
    }

    Ok(Json(InfoResponse {
        name: state.name.clone(),
        instructions: state.instructions.clone(),
        kb_ids: state.kb_ids.clone(),
        knowledge_bases,
        tools: vec![
            ToolDescription {
                name: "search".to_string(),
                description: tool_description("search", DEFAULT_SEARCH_DESCRIPTION),
            },
            ToolDescription {
                name: "info".to_string(),
                description: tool_description("info", DEFAULT_INFO_DESCRIPTION),
            },
            ToolDescription {
                name: "list_documents".to_string(),
                description: tool_description("list_documents", DEFAULT_LIST_DOCUMENTS_DESCRIPTION),
            },
        ],
    }))
}

// ============ POST /tools/list_documents ============

#[derive(Deserialize)]
struct ListDocumentsRequest {
    #[serde(default)]
    kb_id: Option<String>,
}

#[derive(Serialize)]
struct DocumentSummary {
    id: String,
    filename: String,
    format: String,
    status: String,
    chunk_count: usize,
}

#[derive(Serialize)]
struct ListDocumentsResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list_documents(
    State(state): State<SharedState>,
    Json(req): Json<ListDocumentsRequest>,
) -> Result<Json<ListDocumentsResponse>, AppError> {
    let kb_id = resolve_kb(&state, &req.kb_id)?;
    let documents = state
        .manager
        .list_documents(kb_id)
        .await
        .map_err(|e| internal_error(e.message))?;

    Ok(Json(ListDocumentsResponse {
        documents: documents
            .into_iter()
            .map(|d| DocumentSummary {
                id: d.id,
                filename: d.filename,
                format: d.format.as_str().to_string(),
                status: d.status.as_label().to_string(),
                chunk_count: d.chunk_count,
            })
            .collect(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
