//! Structured error type shared across the engine.
//!
//! Every fallible core operation returns [`KError`], which carries a
//! [`ErrorKind`] plus a human message and an optional details map. Callers at
//! the process boundary (CLI, tool-server runtime) serialize this directly;
//! internal call sites normally just use `?` and `anyhow::Context` for extra
//! narrative when wrapping a lower-level error (sqlx, io, reqwest).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The stable, externally-visible category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    UnsupportedFormat,
    ExtractionFailed,
    EmbeddingFailed,
    StorageFailed,
    IndexCorrupt,
    PortUnavailable,
    SubprocessFailed,
    Timeout,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::EmbeddingFailed => "embedding_failed",
            ErrorKind::StorageFailed => "storage_failed",
            ErrorKind::IndexCorrupt => "index_corrupt",
            ErrorKind::PortUnavailable => "port_unavailable",
            ErrorKind::SubprocessFailed => "subprocess_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A structured, user-visible error: `kind`, message, and optional details.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct KError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl KError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<sqlx::Error> for KError {
    fn from(e: sqlx::Error) -> Self {
        KError::new(ErrorKind::StorageFailed, e.to_string())
    }
}

impl From<std::io::Error> for KError {
    fn from(e: std::io::Error) -> Self {
        KError::new(ErrorKind::StorageFailed, e.to_string())
    }
}

pub type KResult<T> = Result<T, KError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let e = KError::not_found("kb missing");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "not_found");
        assert_eq!(v["message"], "kb missing");
        assert!(v.get("details").is_none());
    }

    #[test]
    fn display_matches_kind_and_message() {
        let e = KError::conflict("reindex already running");
        assert_eq!(e.to_string(), "conflict: reindex already running");
    }
}
