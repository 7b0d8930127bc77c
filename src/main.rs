//! # kbasectl
//!
//! Command-line control plane for a kbase instance: create and configure
//! knowledge bases, ingest and query documents, trigger reindexes, and
//! manage the tool servers that expose them to AI tools.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use kbase::config::{self, DataRoot};
use kbase::embedding::{self, EmbeddingSettings};
use kbase::extract::UnavailableOcr;
use kbase::kb_manager::KnowledgeBaseManager;
use kbase::models::{KBConfig, ToolServerKind};
use kbase::progress::ProgressMode;
use kbase::tool_server::ToolServerSupervisor;
use kbase::chunk;

#[derive(Parser)]
#[command(
    name = "kbasectl",
    about = "kbase — a self-hosted knowledge-base ingestion, hybrid-retrieval and tool-server platform",
    version
)]
struct Cli {
    /// Instance data root (knowledge bases, tool-server records, config)
    #[arg(long, global = true, default_value = "./kbase-data")]
    data_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage knowledge bases
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
    /// Manage documents within a knowledge base
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },
    /// Run a hybrid query against a knowledge base
    Query {
        kb_id: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Rebuild a knowledge base's indices from scratch
    Reindex {
        kb_id: String,
        /// JSON-encoded KBConfig overriding the current one; omit to
        /// reindex under the existing config (e.g. after a provider change
        /// made externally).
        #[arg(long)]
        config: Option<String>,
    },
    /// Manage tool servers
    ToolServer {
        #[command(subcommand)]
        action: ToolServerAction,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// JSON-encoded KBConfig; omit for defaults
        #[arg(long)]
        config: Option<String>,
    },
    /// List knowledge bases
    List,
    /// Rename a knowledge base
    Rename { kb_id: String, new_name: String },
    /// Delete a knowledge base and all of its data
    Delete { kb_id: String },
    /// Update a knowledge base's config; prints whether a reindex is required
    UpdateConfig {
        kb_id: String,
        /// JSON-encoded KBConfig
        config: String,
    },
}

#[derive(Subcommand)]
enum DocAction {
    /// Ingest a file into a knowledge base
    Ingest { kb_id: String, path: PathBuf },
    /// List documents in a knowledge base
    List { kb_id: String },
    /// Delete a document from a knowledge base
    Delete { kb_id: String, document_id: String },
}

#[derive(Subcommand)]
enum ToolServerAction {
    /// Create a tool server
    Create {
        name: String,
        /// Comma-separated knowledge base ids
        #[arg(long, value_delimiter = ',')]
        kb_ids: Vec<String>,
        #[arg(long, default_value = "")]
        instructions: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// List tool servers
    List,
    /// Start a tool server's subprocess
    Start { id: String },
    /// Stop a tool server's subprocess
    Stop { id: String },
    /// Delete a tool server
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let data_root = DataRoot::new(&cli.data_root);
    data_root.ensure_exists()?;

    let instance_config = config::load_or_default(&data_root.config_path())?;

    let embedding_settings: EmbeddingSettings = std::env::var("KBASE_EMBEDDING_SETTINGS")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    match cli.command {
        Commands::Kb { action } => run_kb(&data_root, &instance_config, action).await?,
        Commands::Doc { action } => run_doc(&data_root, &embedding_settings, action).await?,
        Commands::Query { kb_id, query, limit } => run_query(&data_root, &embedding_settings, &kb_id, &query, limit).await?,
        Commands::Reindex { kb_id, config } => run_reindex(&data_root, &embedding_settings, &kb_id, config).await?,
        Commands::ToolServer { action } => run_tool_server(&data_root, &instance_config, action).await?,
    }

    Ok(())
}

async fn run_kb(data_root: &DataRoot, instance_config: &config::InstanceConfig, action: KbAction) -> anyhow::Result<()> {
    let manager = KnowledgeBaseManager::open(&data_root.root).await?;

    // Wired so create/rename/delete propagate to the tool-server fleet
    // (default server on create, restart on rename, KB removal on delete).
    let embedding_settings: EmbeddingSettings = std::env::var("KBASE_EMBEDDING_SETTINGS")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let supervisor = ToolServerSupervisor::open(
        &data_root.root,
        instance_config.mcp.start_port,
        instance_config.mcp.max_port,
        embedding_settings,
    )
    .await?;
    manager.attach_tool_servers(std::sync::Arc::new(supervisor)).await;

    match action {
        KbAction::Create { name, description, config } => {
            let config: KBConfig = match config {
                Some(raw) => serde_json::from_str(&raw)?,
                None => KBConfig::default(),
            };
            let kb = manager.create(&name, description, config).await?;
            println!("created knowledge base {} ({})", kb.id, kb.name);
        }
        KbAction::List => {
            for kb in manager.list().await {
                println!("{}\t{}\tgeneration={}", kb.id, kb.name, kb.generation);
            }
        }
        KbAction::Rename { kb_id, new_name } => {
            manager.rename(&kb_id, &new_name).await?;
            println!("renamed {kb_id} to {new_name}");
        }
        KbAction::Delete { kb_id } => {
            manager.delete(&kb_id).await?;
            println!("deleted knowledge base {kb_id}");
        }
        KbAction::UpdateConfig { kb_id, config } => {
            let config: KBConfig = serde_json::from_str(&config)?;
            let requires_reindex = manager.update_config(&kb_id, config).await?;
            println!("config updated; reindex required: {requires_reindex}");
        }
    }
    Ok(())
}

async fn run_doc(data_root: &DataRoot, settings: &EmbeddingSettings, action: DocAction) -> anyhow::Result<()> {
    let manager = KnowledgeBaseManager::open(&data_root.root).await?;
    let provider = embedding::create_provider(settings)?;
    let ocr = UnavailableOcr;
    let counter = chunk::CharHeuristicCounter;
    let reporter = ProgressMode::default_for_tty().reporter();

    match action {
        DocAction::Ingest { kb_id, path } => {
            let bytes = std::fs::read(&path)?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let outcome = manager
                .ingest_file(&kb_id, provider.as_ref(), settings, &ocr, &counter, &filename, bytes, Some(reporter.as_ref()))
                .await?;
            println!("ingested {filename} as {} ({} chunks)", outcome.document_id, outcome.chunk_count);
        }
        DocAction::List { kb_id } => {
            for doc in manager.list_documents(&kb_id).await? {
                println!("{}\t{}\t{}\t{} chunks", doc.id, doc.filename, doc.status.as_label(), doc.chunk_count);
            }
        }
        DocAction::Delete { kb_id, document_id } => {
            manager.delete_document(&kb_id, &document_id).await?;
            println!("deleted document {document_id}");
        }
    }
    Ok(())
}

async fn run_query(
    data_root: &DataRoot,
    settings: &EmbeddingSettings,
    kb_id: &str,
    query: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let manager = KnowledgeBaseManager::open(&data_root.root).await?;
    let provider = embedding::create_provider(settings)?;

    let query_vector = if settings.is_enabled() {
        embedding::embed_batched(provider.as_ref(), settings, &[query.to_string()])
            .await?
            .into_iter()
            .next()
    } else {
        None
    };

    let results = manager.query(kb_id, query_vector.as_deref(), query, limit).await?;
    for r in results {
        println!("[{:.4}] {} ({}#{})", r.score, r.source_filename, r.document_id, r.sequence_index);
        println!("    {}", r.text.chars().take(200).collect::<String>());
    }
    Ok(())
}

async fn run_reindex(
    data_root: &DataRoot,
    settings: &EmbeddingSettings,
    kb_id: &str,
    config_override: Option<String>,
) -> anyhow::Result<()> {
    let manager = KnowledgeBaseManager::open(&data_root.root).await?;
    let provider = embedding::create_provider(settings)?;
    let ocr = UnavailableOcr;
    let counter = chunk::CharHeuristicCounter;
    let reporter = ProgressMode::default_for_tty().reporter();

    let existing = manager.get(kb_id).await?;
    let new_config = match config_override {
        Some(raw) => serde_json::from_str(&raw)?,
        None => existing.kb.read().await.config.clone(),
    };

    let generation = manager
        .reindex(kb_id, new_config, provider.as_ref(), settings, &ocr, &counter, reporter.as_ref())
        .await?;
    println!("reindexed {kb_id}, now generation {generation}");
    Ok(())
}

async fn run_tool_server(
    data_root: &DataRoot,
    instance_config: &config::InstanceConfig,
    action: ToolServerAction,
) -> anyhow::Result<()> {
    let embedding_settings: EmbeddingSettings = std::env::var("KBASE_EMBEDDING_SETTINGS")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let supervisor = ToolServerSupervisor::open(
        &data_root.root,
        instance_config.mcp.start_port,
        instance_config.mcp.max_port,
        embedding_settings,
    )
    .await?;

    match action {
        ToolServerAction::Create { name, kb_ids, instructions, port } => {
            let kind = if kb_ids.len() == 1 { ToolServerKind::Single } else { ToolServerKind::Multi };
            let record = supervisor
                .create(kind, kb_ids, name, instructions, HashMap::new(), port)
                .await?;
            println!("created tool server {} on port {}", record.id, record.port);
        }
        ToolServerAction::List => {
            for record in supervisor.list().await {
                println!("{}\t{}\tport={}\t{:?}", record.id, record.name, record.port, record.status);
            }
        }
        ToolServerAction::Start { id } => {
            let record = supervisor.start(&id).await?;
            println!("tool server {} is {:?}", record.id, record.status);
        }
        ToolServerAction::Stop { id } => {
            let record = supervisor.stop(&id).await?;
            println!("tool server {} is {:?}", record.id, record.status);
        }
        ToolServerAction::Delete { id } => {
            supervisor.delete(&id).await?;
            println!("deleted tool server {id}");
        }
    }
    Ok(())
}
