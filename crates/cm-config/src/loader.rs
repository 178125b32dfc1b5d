//! YAML loader with custom tag support
//!
//! - `!include path` - Include another YAML file, relative to the including file
//! - `!env_var NAME [default]` - Environment variable substitution

use crate::error::{ConfigError, ConfigResult};
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// YAML loader that expands the custom tags
pub struct YamlLoader {
    /// Base directory for resolving relative paths
    base_dir: PathBuf,
    /// Files currently being loaded, to detect circular includes
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            include_stack: HashSet::new(),
        }
    }

    /// Load and process a YAML file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!(path = ?path, "Loading YAML file");

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        self.include_stack.insert(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&path);

        result
    }

    /// Load and process YAML from a string
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        self.process_value(value, source_path)
    }

    /// Load a file and deserialize it
    pub fn load_as<T: DeserializeOwned>(&mut self, path: impl AsRef<Path>) -> ConfigResult<T> {
        let path = self.resolve_path(path.as_ref());
        let value = self.load_file(&path)?;
        serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml { path, source: e })
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    let processed_key = self.process_value(k, source_path)?;
                    let processed_value = self.process_value(v, source_path)?;
                    result.insert(processed_key, processed_value);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => {
                let result: ConfigResult<Vec<Value>> = seq
                    .into_iter()
                    .map(|v| self.process_value(v, source_path))
                    .collect();
                Ok(Value::Sequence(result?))
            }
            _ => Ok(value),
        }
    }

    fn process_tagged(
        &mut self,
        tagged: serde_yaml::value::TaggedValue,
        source_path: &Path,
    ) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        let value = tagged.value;

        trace!(tag = %tag, "Processing tag");

        match tag.as_str() {
            "!include" => self.process_include(value, source_path),
            "!env_var" => process_env_var(value),
            _ => {
                // Unknown tag, keep it but process the inner value
                let processed = self.process_value(value, source_path)?;
                Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                    tag: tagged.tag,
                    value: processed,
                })))
            }
        }
    }

    fn process_include(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        let Value::String(relative) = value else {
            return Err(ConfigError::InvalidValue {
                key: "!include".to_string(),
                reason: "path must be a string".to_string(),
            });
        };

        let base_dir = source_path.parent().unwrap_or(&self.base_dir);
        let path = if Path::new(&relative).is_absolute() {
            PathBuf::from(&relative)
        } else {
            base_dir.join(&relative)
        };
        if !path.exists() {
            return Err(ConfigError::IncludeNotFound { path });
        }

        debug!(path = ?path, "Including file");
        self.load_file(&path)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// `!env_var NAME` or `!env_var NAME default words`
///
/// The substituted text is re-parsed as a YAML scalar, so `!env_var PORT 8080`
/// yields a number.
fn process_env_var(value: Value) -> ConfigResult<Value> {
    let Value::String(argument) = value else {
        return Err(ConfigError::InvalidValue {
            key: "!env_var".to_string(),
            reason: "environment variable name must be a string".to_string(),
        });
    };

    let (name, default) = match argument.trim().split_once(char::is_whitespace) {
        Some((name, default)) => (name, Some(default.trim())),
        None => (argument.trim(), None),
    };

    let text = match (std::env::var(name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => {
            return Err(ConfigError::EnvVarNotFound {
                var: name.to_string(),
            })
        }
    };

    debug!(var = %name, "Substituted env var");
    Ok(scalar(&text))
}

fn scalar(text: &str) -> Value {
    match serde_yaml::from_str::<Value>(text) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => value,
        _ => Value::String(text.to_string()),
    }
}

/// Load a YAML file with tag processing
pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(PathBuf::new()).load_file(path)
}

/// All YAML files in a directory, sorted by name
pub fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ConfigError::ReadFile {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Deserialize every YAML file in `dir`, one item per file, in file name order
pub fn load_yaml_dir<T: DeserializeOwned>(dir: impl AsRef<Path>) -> ConfigResult<Vec<T>> {
    let dir = dir.as_ref();
    // yaml_files already yields paths under dir
    let mut loader = YamlLoader::new(PathBuf::new());
    let items = yaml_files(dir)?
        .into_iter()
        .map(|file| loader.load_as(file))
        .collect::<ConfigResult<Vec<T>>>()?;
    debug!(dir = ?dir, count = items.len(), "Loaded YAML directory");
    Ok(items)
}
