//! Runtime configuration from `runtime.yaml`

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Which side of the satellite link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Owns the resources; may spawn and serve a satellite
    #[default]
    Primary,
    /// Drives the primary's resources over stdin/stdout
    Satellite,
}

/// Satellite child process spawned by a primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root of persisted data: profiles and resource files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub mode: RuntimeMode,

    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between reconnect attempts of disconnected resources
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: f64,

    #[serde(default)]
    pub satellite: Option<SatelliteConfig>,

    /// Initial values of the settings store
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retry_interval() -> f64 {
    5.0
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mode: RuntimeMode::default(),
            log_level: default_log_level(),
            retry_interval_secs: default_retry_interval(),
            satellite: None,
            settings: serde_json::Map::new(),
        }
    }
}

impl RuntimeConfig {
    /// Check values serde cannot
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.retry_interval_secs.is_finite() || self.retry_interval_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "retry_interval_secs".to_string(),
                reason: format!("must be positive, got {}", self.retry_interval_secs),
            });
        }
        if let Some(satellite) = &self.satellite {
            if self.mode == RuntimeMode::Satellite {
                return Err(ConfigError::InvalidValue {
                    key: "satellite".to_string(),
                    reason: "a satellite cannot spawn its own satellite".to_string(),
                });
            }
            if satellite.command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "satellite.command".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_interval_secs).unwrap_or(Duration::MAX)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    /// Directory holding one file per resource of `kind`
    pub fn resources_dir(&self, kind: &str) -> PathBuf {
        self.data_dir.join("resources").join(kind)
    }

    /// Resolve a relative `data_dir` against `base`
    pub fn rooted_at(mut self, base: &Path) -> Self {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
        self
    }
}

/// Load and validate `runtime.yaml`
///
/// A relative `data_dir` is taken relative to the file's directory.
pub fn load_runtime_config(path: impl AsRef<Path>) -> ConfigResult<RuntimeConfig> {
    let path = path.as_ref();
    let config: RuntimeConfig = YamlLoader::new(PathBuf::new()).load_as(path)?;
    let config = match path.parent() {
        Some(base) => config.rooted_at(base),
        None => config,
    };
    config.validate()?;

    info!(
        path = ?path,
        mode = ?config.mode,
        data_dir = ?config.data_dir,
        "Loaded runtime config"
    );
    Ok(config)
}
