//! YAML configuration loading for the automation runtime
//!
//! `runtime.yaml` describes one process: where its data lives, whether it is
//! the primary or a satellite, and the satellite it spawns. Profiles live in
//! `<data_dir>/profiles/*.yaml`, one profile per file.
//!
//! Supported tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var NAME [default]` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use cm_config::{load_runtime_config, load_yaml_dir};
//!
//! let config = load_runtime_config("runtime.yaml")?;
//! let profiles: Vec<Profile> = load_yaml_dir(config.profiles_dir())?;
//! ```

mod error;
mod loader;
mod runtime;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_dir, yaml_files, YamlLoader};
pub use runtime::{load_runtime_config, RuntimeConfig, RuntimeMode, SatelliteConfig};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
