//! One JSON file per resource
//!
//! ```json
//! {
//!   "version": 1,
//!   "id": "01J9Z...",
//!   "config": { ... }
//! }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Current resource file format version
pub const RESOURCE_FILE_VERSION: u32 = 1;

const EXTENSION: &str = "json";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("version mismatch for {id}: expected {expected}, found {found}")]
    VersionMismatch { id: String, expected: u32, found: u32 },

    #[error("file {file} holds resource {found}")]
    IdMismatch { file: String, found: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted form of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFile<C> {
    pub version: u32,
    pub id: String,
    pub config: C,
}

impl<C> ResourceFile<C> {
    pub fn new(id: impl Into<String>, config: C) -> Self {
        Self {
            version: RESOURCE_FILE_VERSION,
            id: id.into(),
            config,
        }
    }
}

/// Directory of resource files for one resource kind
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the resource directory exists
    pub async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            debug!("Created resource directory: {:?}", self.dir);
        }
        Ok(())
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    /// Write a resource file atomically (temp file, then rename)
    pub async fn save<C: Serialize>(&self, id: &str, config: &C) -> StorageResult<()> {
        self.ensure_dir().await?;

        let path = self.file_path(id);
        let temp_path = self.dir.join(format!("{}.{}.tmp", id, EXTENSION));

        let content = serde_json::to_string_pretty(&ResourceFile::new(id, config))?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(id = %id, "Saved resource file");
        Ok(())
    }

    /// Read one resource file. Returns `None` if it doesn't exist.
    pub async fn load<C: DeserializeOwned>(&self, id: &str) -> StorageResult<Option<ResourceFile<C>>> {
        let path = self.file_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_file(id, &path).await.map(Some)
    }

    async fn read_file<C: DeserializeOwned>(
        &self,
        id: &str,
        path: &Path,
    ) -> StorageResult<ResourceFile<C>> {
        let content = fs::read_to_string(path).await?;
        let file: ResourceFile<C> = serde_json::from_str(&content)?;

        if file.version != RESOURCE_FILE_VERSION {
            return Err(StorageError::VersionMismatch {
                id: id.to_string(),
                expected: RESOURCE_FILE_VERSION,
                found: file.version,
            });
        }
        if file.id != id {
            return Err(StorageError::IdMismatch {
                file: id.to_string(),
                found: file.id,
            });
        }
        Ok(file)
    }

    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.file_path(id);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(id = %id, "Deleted resource file");
        }
        Ok(())
    }

    /// Ids of all resource files, sorted. Temp files are skipped.
    pub async fn list_ids(&self) -> StorageResult<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Read every resource file
    ///
    /// One unreadable file does not stop the scan; its error is returned in
    /// place of its contents.
    pub async fn load_all<C: DeserializeOwned>(
        &self,
    ) -> StorageResult<Vec<(String, StorageResult<ResourceFile<C>>)>> {
        let ids = self.list_ids().await?;
        let mut files = Vec::with_capacity(ids.len());

        for id in ids {
            let path = self.file_path(&id);
            let result = self.read_file(&id, &path).await;
            if let Err(e) = &result {
                warn!(id = %id, error = %e, "Failed to read resource file");
            }
            files.push((id, result));
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("Plug"));

        store.save("desk", &json!({"host": "10.0.0.5"})).await.unwrap();

        let file: ResourceFile<Value> = store.load("desk").await.unwrap().unwrap();
        assert_eq!(file.version, RESOURCE_FILE_VERSION);
        assert_eq!(file.id, "desk");
        assert_eq!(file.config, json!({"host": "10.0.0.5"}));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());

        let file: Option<ResourceFile<Value>> = store.load("nope").await.unwrap();
        assert!(file.is_none());
    }

    #[tokio::test]
    async fn test_list_skips_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());

        store.save("b", &json!({})).await.unwrap();
        store.save("a", &json!({})).await.unwrap();
        fs::write(temp.path().join("c.json.tmp"), "{").await.unwrap();
        fs::write(temp.path().join("notes.txt"), "hello").await.unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_load_all_reports_bad_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());

        store.save("good", &json!({"n": 1})).await.unwrap();
        fs::write(temp.path().join("broken.json"), "{ not json").await.unwrap();

        let files = store.load_all::<Value>().await.unwrap();
        assert_eq!(files.len(), 2);

        let (id, broken) = &files[0];
        assert_eq!(id, "broken");
        assert!(matches!(broken, Err(StorageError::Json(_))));

        let (id, good) = &files[1];
        assert_eq!(id, "good");
        assert_eq!(good.as_ref().unwrap().config, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_id_mismatch_detected() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());

        let content = serde_json::to_string(&ResourceFile::new("other", json!({}))).unwrap();
        fs::write(temp.path().join("renamed.json"), content).await.unwrap();

        let result = store.load::<Value>("renamed").await;
        assert!(matches!(result, Err(StorageError::IdMismatch { .. })));
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());

        store.save("gone", &json!({})).await.unwrap();
        store.delete("gone").await.unwrap();
        store.delete("gone").await.unwrap();

        assert!(store.list_ids().await.unwrap().is_empty());
    }
}
