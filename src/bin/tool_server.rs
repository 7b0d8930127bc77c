//! Thin entry point for the `kbase-tool-server` subprocess. All it does is
//! read its configuration from the environment (set by the supervisor at
//! spawn time, see [`kbase::tool_server`]) and hand off to the runtime.

use kbase::tool_server::runtime::{self, RuntimeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = RuntimeConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    runtime::run(config).await
}
