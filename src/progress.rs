//! Progress reporting for ingestion and reindex. Events are emitted on
//! stderr (human or JSON) so stdout stays parseable for scripts, and a
//! reindex's latest snapshot is additionally kept in memory so a caller can
//! poll it ("publish progress").

use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::RwLock;

/// A single ingestion progress event, one per document.
#[derive(Clone, Debug)]
pub enum IngestEvent {
    Extracting { document: String },
    Embedding { document: String, chunks: usize },
    Completed { document: String, chunks: usize },
    Failed { document: String, reason: String },
}

/// Reindex progress: processed/total counts, the file currently being
/// rebuilt, and per-document success/failure tallies.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ReindexProgress {
    pub processed: usize,
    pub total: usize,
    pub percent: f32,
    pub current_file: Option<String>,
    pub current_file_progress: f32,
    pub succeeded: usize,
    pub failed: usize,
}

impl ReindexProgress {
    pub fn started(total: usize) -> Self {
        Self {
            processed: 0,
            total,
            percent: 0.0,
            current_file: None,
            current_file_progress: 0.0,
            succeeded: 0,
            failed: 0,
        }
    }
}

/// Reports progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report_ingest(&self, event: IngestEvent);
    fn report_reindex(&self, progress: &ReindexProgress);
}

pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report_ingest(&self, event: IngestEvent) {
        let line = match &event {
            IngestEvent::Extracting { document } => format!("ingest {document}  extracting...\n"),
            IngestEvent::Embedding { document, chunks } => {
                format!("ingest {document}  embedding  {chunks} chunks\n")
            }
            IngestEvent::Completed { document, chunks } => {
                format!("ingest {document}  ready  {chunks} chunks\n")
            }
            IngestEvent::Failed { document, reason } => {
                format!("ingest {document}  failed  {reason}\n")
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }

    fn report_reindex(&self, progress: &ReindexProgress) {
        let file = progress.current_file.as_deref().unwrap_or("-");
        let line = format!(
            "reindex  {}/{} ({:.0}%)  {}  succeeded={} failed={}\n",
            progress.processed,
            progress.total,
            progress.percent,
            file,
            progress.succeeded,
            progress.failed
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report_ingest(&self, event: IngestEvent) {
        let obj = match &event {
            IngestEvent::Extracting { document } => serde_json::json!({
                "event": "ingest", "phase": "extracting", "document": document
            }),
            IngestEvent::Embedding { document, chunks } => serde_json::json!({
                "event": "ingest", "phase": "embedding", "document": document, "chunks": chunks
            }),
            IngestEvent::Completed { document, chunks } => serde_json::json!({
                "event": "ingest", "phase": "ready", "document": document, "chunks": chunks
            }),
            IngestEvent::Failed { document, reason } => serde_json::json!({
                "event": "ingest", "phase": "failed", "document": document, "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
            let _ = std::io::stderr().lock().flush();
        }
    }

    fn report_reindex(&self, progress: &ReindexProgress) {
        if let Ok(line) = serde_json::to_string(progress) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report_ingest(&self, _event: IngestEvent) {}
    fn report_reindex(&self, _progress: &ReindexProgress) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// In-memory table of the latest reindex snapshot per KB, so a caller (CLI
/// status command, tool-server supervisor) can poll without blocking on the
/// reindex itself.
#[derive(Default)]
pub struct ReindexProgressTable {
    inner: RwLock<HashMap<String, ReindexProgress>>,
}

impl ReindexProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kb_id: &str, progress: ReindexProgress) {
        self.inner.write().unwrap().insert(kb_id.to_string(), progress);
    }

    pub fn get(&self, kb_id: &str) -> Option<ReindexProgress> {
        self.inner.read().unwrap().get(kb_id).cloned()
    }

    pub fn clear(&self, kb_id: &str) {
        self.inner.write().unwrap().remove(kb_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reindex_progress_table_set_then_get() {
        let table = ReindexProgressTable::new();
        table.set("kb1", ReindexProgress::started(10));
        let got = table.get("kb1").unwrap();
        assert_eq!(got.total, 10);
        assert_eq!(got.processed, 0);
    }

    #[test]
    fn reindex_progress_table_clear_removes_entry() {
        let table = ReindexProgressTable::new();
        table.set("kb1", ReindexProgress::started(10));
        table.clear("kb1");
        assert!(table.get("kb1").is_none());
    }

    #[test]
    fn missing_kb_returns_none() {
        let table = ReindexProgressTable::new();
        assert!(table.get("nope").is_none());
    }
}
