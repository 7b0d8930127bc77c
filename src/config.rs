//! Instance-level configuration (`<root>/config.json`).
//!
//! A plain `serde::Deserialize` struct with field-level defaults and a
//! validation pass that returns readable errors via `anyhow::Context`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            frontend: FrontendConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: default_backend_port(),
            host: default_host(),
        }
    }
}

fn default_backend_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    #[serde(default = "default_frontend_port")]
    pub port: u16,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            port: default_frontend_port(),
        }
    }
}

fn default_frontend_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            max_port: default_max_port(),
        }
    }
}

fn default_start_port() -> u16 {
    8100
}
fn default_max_port() -> u16 {
    8200
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mcp.start_port > self.mcp.max_port {
            anyhow::bail!(
                "mcp.start_port ({}) must be <= mcp.max_port ({})",
                self.mcp.start_port,
                self.mcp.max_port
            );
        }
        Ok(())
    }
}

/// Load `config.json` from `path`, or fall back to defaults if the file
/// does not exist yet (first run against a fresh data root).
pub fn load_or_default(path: &Path) -> Result<InstanceConfig> {
    if !path.exists() {
        return Ok(InstanceConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file: {}", path.display()))?;
    let cfg: InstanceConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn save(path: &Path, config: &InstanceConfig) -> Result<()> {
    let raw = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
}

/// Layout of the per-instance data root.
#[derive(Debug, Clone)]
pub struct DataRoot {
    pub root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn kb_dir(&self, kb_id: &str) -> PathBuf {
        self.root.join("knowledge-bases").join(kb_id)
    }

    pub fn knowledge_bases_dir(&self) -> PathBuf {
        self.root.join("knowledge-bases")
    }

    pub fn tool_servers_path(&self) -> PathBuf {
        self.root.join("tool-servers.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(self.knowledge_bases_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_documented_ports() {
        let c = InstanceConfig::default();
        assert_eq!(c.backend.port, 8000);
        assert_eq!(c.frontend.port, 3000);
        assert_eq!(c.mcp.start_port, 8100);
        assert_eq!(c.mcp.max_port, 8200);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut c = InstanceConfig::default();
        c.mcp.start_port = 9000;
        c.mcp.max_port = 8000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.backend.port, 8000);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = InstanceConfig::default();
        cfg.backend.port = 9090;
        save(&path, &cfg).unwrap();
        let loaded = load_or_default(&path).unwrap();
        assert_eq!(loaded.backend.port, 9090);
    }
}
