//! Automation runtime binary
//!
//! Usage: `cm-runtime [runtime.yaml]`

use anyhow::Result;
use cm_config::{load_runtime_config, RuntimeConfig};
use cm_server::Runtime;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_CONFIG: &str = "runtime.yaml";

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if path.exists() {
        Ok(load_runtime_config(path)?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = load_config(&path)?;

    // stdout carries the satellite channel, so logs go to stderr
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(config = ?path, "Starting automation runtime");

    let mut runtime = Runtime::new(config)?;
    let profiles = runtime.load_profiles()?;
    info!(profiles = profiles, "Profiles loaded");
    runtime.start_satellite()?;

    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
}
