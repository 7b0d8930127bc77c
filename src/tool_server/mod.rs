//! Tool-server supervisor: creates, starts, stops, and restarts the
//! `kbase-tool-server` subprocess for each configured tool server, and keeps
//! `tool-servers.json` as the durable record of what should be running.
//!
//! The supervisor never binds a port itself — it probes a candidate by
//! binding then immediately dropping a `TcpListener`, so the window between
//! "probed free" and "child binds it" is as small as a process spawn, not a
//! held socket ("the supervisor must not bind ports itself").

pub mod runtime;

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::embedding::EmbeddingSettings;
use crate::error::{ErrorKind, KError, KResult};
use crate::models::{ToolOverride, ToolServerKind, ToolServerRecord, ToolServerStatus};

/// Time a child is given to start serving `/health` before the start is
/// considered failed.
const START_TIMEOUT: Duration = Duration::from_secs(10);
/// Time a child is given to exit after its handle is dropped before it is
/// force-killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Auto-restart is bounded: at most this many crashes within the window
/// below before a server is left `crashed` rather than retried.
const MAX_RESTARTS: u32 = 3;
const RESTART_WINDOW: chrono::Duration = chrono::Duration::seconds(60);

fn health_poll_interval() -> Duration {
    Duration::from_millis(100)
}

#[derive(Serialize, Deserialize, Default)]
struct RecordFile {
    servers: Vec<ToolServerRecord>,
}

struct RunningChild {
    child: Child,
}

/// Owns the durable tool-server records plus the live child processes.
pub struct ToolServerSupervisor {
    data_root: PathBuf,
    records_path: PathBuf,
    start_port: u16,
    max_port: u16,
    embedding: EmbeddingSettings,
    records: RwLock<HashMap<String, ToolServerRecord>>,
    children: RwLock<HashMap<String, RunningChild>>,
}

impl ToolServerSupervisor {
    /// Load `tool-servers.json` if present; any server recorded as
    /// `running`/`starting` is downgraded to `stopped` since its subprocess
    /// did not survive the previous instance's lifetime. `embedding` is
    /// forwarded to every spawned child so it can recompute query
    /// embeddings with the same provider ingestion used.
    pub async fn open(
        data_root: &Path,
        start_port: u16,
        max_port: u16,
        embedding: EmbeddingSettings,
    ) -> KResult<Self> {
        let records_path = data_root.join("tool-servers.json");
        let mut records = HashMap::new();
        if records_path.exists() {
            let raw = std::fs::read_to_string(&records_path)?;
            let file: RecordFile = serde_json::from_str(&raw)
                .map_err(|e| KError::new(ErrorKind::StorageFailed, format!("parsing tool-servers.json: {e}")))?;
            for mut record in file.servers {
                if matches!(record.status, ToolServerStatus::Running | ToolServerStatus::Starting) {
                    record.status = ToolServerStatus::Stopped;
                }
                records.insert(record.id.clone(), record);
            }
        }

        Ok(Self {
            data_root: data_root.to_path_buf(),
            records_path,
            start_port,
            max_port,
            embedding,
            records: RwLock::new(records),
            children: RwLock::new(HashMap::new()),
        })
    }

    async fn persist(&self, records: &HashMap<String, ToolServerRecord>) -> KResult<()> {
        let file = RecordFile {
            servers: records.values().cloned().collect(),
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| KError::new(ErrorKind::Internal, e.to_string()))?;
        if let Some(parent) = self.records_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.records_path, raw)?;
        Ok(())
    }

    /// Probe for a free port in `[start_port, max_port]`, excluding any port
    /// already held by an enabled record: try `requested` first if given and
    /// in range, then walk the range from `start_port`. The listener is
    /// dropped immediately after binding, so the port is free again the
    /// instant this function returns — the caller (the child process) must
    /// bind it before anything else grabs it. Checking against `held` is
    /// what actually enforces port uniqueness: two enabled servers created
    /// back to back are both `stopped` (nothing bound yet), so OS-level
    /// probing alone would hand both the same port.
    fn probe_free_port(&self, requested: Option<u16>, held: &std::collections::HashSet<u16>) -> KResult<u16> {
        if let Some(port) = requested {
            if (self.start_port..=self.max_port).contains(&port)
                && !held.contains(&port)
                && Self::port_is_free(port)
            {
                return Ok(port);
            }
        }
        for port in self.start_port..=self.max_port {
            if !held.contains(&port) && Self::port_is_free(port) {
                return Ok(port);
            }
        }
        Err(KError::new(
            ErrorKind::PortUnavailable,
            format!("no free ports in [{}, {}]", self.start_port, self.max_port),
        ))
    }

    fn port_is_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Create a new tool-server record in the `stopped` state. Does not
    /// start the subprocess.
    pub async fn create(
        &self,
        kind: ToolServerKind,
        kb_ids: Vec<String>,
        name: String,
        instructions: String,
        tool_overrides: HashMap<String, ToolOverride>,
        requested_port: Option<u16>,
    ) -> KResult<ToolServerRecord> {
        if kb_ids.is_empty() {
            return Err(KError::invalid_input("a tool server must serve at least one knowledge base"));
        }
        if matches!(kind, ToolServerKind::Single) && kb_ids.len() != 1 {
            return Err(KError::invalid_input("a single-KB tool server must serve exactly one knowledge base"));
        }

        let mut records = self.records.write().await;
        let held: std::collections::HashSet<u16> = records
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.port)
            .collect();
        let port = self.probe_free_port(requested_port, &held)?;
        let record = ToolServerRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            name,
            instructions,
            port,
            enabled: true,
            kb_ids,
            tool_overrides,
            status: ToolServerStatus::Stopped,
            last_error: None,
            restart_count: 0,
            last_restart_window_start: None,
        };

        records.insert(record.id.clone(), record.clone());
        self.persist(&records).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> KResult<ToolServerRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| KError::not_found(format!("tool server not found: {id}")))
    }

    pub async fn list(&self) -> Vec<ToolServerRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Start a server's subprocess and wait for it to report healthy, or
    /// time out and mark it `crashed`.
    pub async fn start(&self, id: &str) -> KResult<ToolServerRecord> {
        let record = self.get(id).await?;
        if matches!(record.status, ToolServerStatus::Running | ToolServerStatus::Starting) {
            return Ok(record);
        }

        self.set_status(id, ToolServerStatus::Starting, None).await?;
        match self.spawn_and_wait(&record).await {
            Ok(child) => {
                self.children.write().await.insert(id.to_string(), RunningChild { child });
                self.set_status(id, ToolServerStatus::Running, None).await?;
                self.reset_restart_window(id).await?;
                self.get(id).await
            }
            Err(e) => {
                self.record_crash(id, &e.message).await?;
                Err(e)
            }
        }
    }

    async fn spawn_and_wait(&self, record: &ToolServerRecord) -> KResult<Child> {
        let overrides = serde_json::to_string(&record.tool_overrides)
            .map_err(|e| KError::new(ErrorKind::Internal, e.to_string()))?;
        let embedding_json = serde_json::to_string(&self.embedding)
            .map_err(|e| KError::new(ErrorKind::Internal, e.to_string()))?;

        let mut command = Command::new(std::env::current_exe().unwrap_or_else(|_| PathBuf::from("kbase-tool-server")));
        command
            .env(runtime::ENV_DATA_ROOT, &self.data_root)
            .env(runtime::ENV_KB_IDS, record.kb_ids.join(","))
            .env(runtime::ENV_NAME, &record.name)
            .env(runtime::ENV_INSTRUCTIONS, &record.instructions)
            .env(runtime::ENV_OVERRIDES, overrides)
            .env(runtime::ENV_PORT, record.port.to_string())
            .env("KBASE_EMBEDDING_SETTINGS", embedding_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| KError::new(ErrorKind::SubprocessFailed, format!("spawning tool-server: {e}")))?;

        self.wait_healthy(record.port).await?;
        Ok(child)
    }

    async fn wait_healthy(&self, port: u16) -> KResult<()> {
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        let client = reqwest::Client::new();
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(health_poll_interval()).await;
        }
        Err(KError::new(
            ErrorKind::Timeout,
            format!("tool server did not become healthy within {}s", START_TIMEOUT.as_secs()),
        ))
    }

    /// Stop a server's subprocess: drop the handle (SIGKILL on drop via
    /// `kill_on_drop`) after giving it `STOP_TIMEOUT` to exit on its own.
    pub async fn stop(&self, id: &str) -> KResult<ToolServerRecord> {
        self.set_status(id, ToolServerStatus::Stopping, None).await?;
        if let Some(mut running) = self.children.write().await.remove(id) {
            match tokio::time::timeout(STOP_TIMEOUT, running.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = running.child.kill().await;
                }
            }
        }
        self.set_status(id, ToolServerStatus::Stopped, None).await?;
        self.get(id).await
    }

    /// Update a record's serving fields. If the server is running and any
    /// field that affects what it serves changed, it is restarted in place
    /// (stop, then start on the same port).
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        instructions: Option<String>,
        kb_ids: Option<Vec<String>>,
        tool_overrides: Option<HashMap<String, ToolOverride>>,
        enabled: Option<bool>,
    ) -> KResult<ToolServerRecord> {
        let was_running = matches!(self.get(id).await?.status, ToolServerStatus::Running);
        let mut changed = false;

        {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| KError::not_found(format!("tool server not found: {id}")))?;
            if let Some(name) = name {
                changed |= record.name != name;
                record.name = name;
            }
            if let Some(instructions) = instructions {
                changed |= record.instructions != instructions;
                record.instructions = instructions;
            }
            if let Some(kb_ids) = kb_ids {
                if kb_ids.is_empty() {
                    return Err(KError::invalid_input("a tool server must serve at least one knowledge base"));
                }
                changed |= record.kb_ids != kb_ids;
                record.kb_ids = kb_ids;
            }
            if let Some(tool_overrides) = tool_overrides {
                changed |= record.tool_overrides != tool_overrides;
                record.tool_overrides = tool_overrides;
            }
            if let Some(enabled) = enabled {
                record.enabled = enabled;
            }
            self.persist_sync(&records)?;
        }

        if was_running && changed {
            self.stop(id).await?;
            self.start(id).await?;
        }
        self.get(id).await
    }

    fn persist_sync(&self, records: &HashMap<String, ToolServerRecord>) -> KResult<()> {
        let file = RecordFile {
            servers: records.values().cloned().collect(),
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| KError::new(ErrorKind::Internal, e.to_string()))?;
        if let Some(parent) = self.records_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.records_path, raw)?;
        Ok(())
    }

    /// Stop (if running) and remove a tool-server record entirely.
    pub async fn delete(&self, id: &str) -> KResult<()> {
        if self.children.read().await.contains_key(id) {
            self.stop(id).await?;
        }
        let mut records = self.records.write().await;
        records
            .remove(id)
            .ok_or_else(|| KError::not_found(format!("tool server not found: {id}")))?;
        self.persist_sync(&records)?;
        Ok(())
    }

    /// React to a KB being renamed: the KB's display name is read live by
    /// the runtime's `info` handler, so there is no cached copy to update
    /// here, but a running server must restart so clients connected to it
    /// observe the rename promptly rather than waiting for their own
    /// `info` poll.
    pub async fn on_kb_renamed(&self, kb_id: &str, new_name: &str) {
        let affected: Vec<String> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.kb_ids.iter().any(|id| id == kb_id))
            .map(|r| r.id.clone())
            .collect();
        for id in affected {
            tracing::info!(tool_server_id = %id, kb_id, new_name, "knowledge base renamed; restarting server");
            if matches!(self.get(&id).await.map(|r| r.status), Ok(ToolServerStatus::Running)) {
                if let Err(e) = self.stop(&id).await {
                    tracing::warn!(tool_server_id = %id, error = %e.message, "failed to stop server for rename restart");
                    continue;
                }
                if let Err(e) = self.start(&id).await {
                    tracing::warn!(tool_server_id = %id, error = %e.message, "failed to restart server after rename");
                }
            }
        }
    }

    /// React to a KB being deleted: remove it from every server's KB set,
    /// deleting servers left with none.
    pub async fn on_kb_deleted(&self, kb_id: &str) -> KResult<()> {
        let ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        for id in ids {
            let record = self.get(&id).await?;
            if !record.kb_ids.iter().any(|k| k == kb_id) {
                continue;
            }
            let remaining: Vec<String> = record.kb_ids.into_iter().filter(|k| k != kb_id).collect();
            if remaining.is_empty() {
                self.delete(&id).await?;
            } else {
                self.update(&id, None, None, Some(remaining), None, None).await?;
            }
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ToolServerStatus, error: Option<String>) -> KResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| KError::not_found(format!("tool server not found: {id}")))?;
        record.status = status;
        if error.is_some() {
            record.last_error = error;
        } else if matches!(status, ToolServerStatus::Running) {
            record.last_error = None;
        }
        self.persist_sync(&records)
    }

    async fn reset_restart_window(&self, id: &str) -> KResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.restart_count = 0;
            record.last_restart_window_start = None;
        }
        self.persist_sync(&records)
    }

    /// Record a crash and, if within the auto-restart budget, attempt one
    /// restart. Exceeding the budget within the window leaves the server in
    /// `crashed` for an operator to investigate.
    async fn record_crash(&self, id: &str, reason: &str) -> KResult<()> {
        let should_retry = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| KError::not_found(format!("tool server not found: {id}")))?;

            let now = Utc::now();
            let window_start = record.last_restart_window_start.unwrap_or(now);
            if now - window_start > RESTART_WINDOW {
                record.restart_count = 0;
                record.last_restart_window_start = Some(now);
            } else if record.last_restart_window_start.is_none() {
                record.last_restart_window_start = Some(now);
            }

            record.restart_count += 1;
            record.last_error = Some(reason.to_string());
            record.status = ToolServerStatus::Crashed;
            let should_retry = record.restart_count <= MAX_RESTARTS;
            self.persist_sync(&records)?;
            should_retry
        };

        if should_retry {
            tracing::warn!(tool_server_id = id, reason, "tool server crashed, retrying start");
            let _ = Box::pin(self.start(id)).await;
        } else {
            tracing::error!(tool_server_id = id, reason, "tool server exceeded restart budget, leaving crashed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn create_assigns_a_port_in_range() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let record = sup
            .create(
                ToolServerKind::Single,
                vec!["kb-1".to_string()],
                "kb-1 server".to_string(),
                String::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        assert!((9100..=9200).contains(&record.port));
        assert_eq!(record.status, ToolServerStatus::Stopped);
    }

    #[tokio::test]
    async fn create_rejects_empty_kb_set() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let err = sup
            .create(ToolServerKind::Multi, vec![], "empty".to_string(), String::new(), HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn single_kind_requires_exactly_one_kb() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let err = sup
            .create(
                ToolServerKind::Single,
                vec!["kb-1".to_string(), "kb-2".to_string()],
                "bad".to_string(),
                String::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn records_persist_across_reopen() {
        let dir = tmp_root();
        {
            let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
            sup.create(
                ToolServerKind::Single,
                vec!["kb-1".to_string()],
                "kb-1 server".to_string(),
                String::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        }
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        assert_eq!(sup.list().await.len(), 1);
    }

    #[tokio::test]
    async fn reopen_downgrades_running_records_to_stopped() {
        let dir = tmp_root();
        {
            let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
            let record = sup
                .create(
                    ToolServerKind::Single,
                    vec!["kb-1".to_string()],
                    "kb-1 server".to_string(),
                    String::new(),
                    HashMap::new(),
                    None,
                )
                .await
                .unwrap();
            sup.set_status(&record.id, ToolServerStatus::Running, None).await.unwrap();
        }
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let record = sup.list().await.into_iter().next().unwrap();
        assert_eq!(record.status, ToolServerStatus::Stopped);
    }

    #[tokio::test]
    async fn on_kb_deleted_removes_server_left_with_no_kbs() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let record = sup
            .create(
                ToolServerKind::Single,
                vec!["kb-1".to_string()],
                "kb-1 server".to_string(),
                String::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        sup.on_kb_deleted("kb-1").await.unwrap();
        assert!(sup.get(&record.id).await.is_err());
        let _ = record;
    }

    #[tokio::test]
    async fn distinct_servers_never_share_a_port() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let mut ports = Vec::new();
        for i in 0..5 {
            let record = sup
                .create(
                    ToolServerKind::Single,
                    vec![format!("kb-{i}")],
                    format!("server-{i}"),
                    String::new(),
                    HashMap::new(),
                    None,
                )
                .await
                .unwrap();
            ports.push(record.port);
        }
        let mut unique = ports.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ports.len());
    }

    #[tokio::test]
    async fn requested_port_is_honored_when_free() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let record = sup
            .create(
                ToolServerKind::Single,
                vec!["kb-1".to_string()],
                "kb-1 server".to_string(),
                String::new(),
                HashMap::new(),
                Some(9150),
            )
            .await
            .unwrap();
        assert_eq!(record.port, 9150);
    }

    #[tokio::test]
    async fn on_kb_renamed_does_not_error_for_unrelated_server() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        sup.create(
            ToolServerKind::Single,
            vec!["kb-1".to_string()],
            "kb-1 server".to_string(),
            String::new(),
            HashMap::new(),
            None,
        )
        .await
        .unwrap();
        // No server references "kb-2"; renaming it must be a harmless no-op.
        sup.on_kb_renamed("kb-2", "new name").await;
    }

    #[tokio::test]
    async fn update_rejects_unknown_server() {
        let dir = tmp_root();
        let sup = ToolServerSupervisor::open(dir.path(), 9100, 9200, EmbeddingSettings::default()).await.unwrap();
        let err = sup
            .update("does-not-exist", Some("x".to_string()), None, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
