//! Live registry of the resources of one kind

use crate::file::FileStore;
use crate::lifecycle::{ConnectionStatus, ResourceLifecycle};
use crate::resource::{Resource, ResourceCore};
use crate::{ResourceError, ResourceLoadError, ResourceResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

/// Outcome of [`ResourceStorage::load_all`]
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Loaded and connected
    pub loaded: Vec<String>,
    /// Loaded, but runtime members failed to come up
    pub disconnected: Vec<String>,
    /// Files that could not be turned into a resource
    pub failed: Vec<ResourceLoadError>,
}

fn validate_id(id: &str) -> ResourceResult<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ResourceError::InvalidId(id.to_string()))
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key
fn merge_patch(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        map.remove(&key);
                    } else {
                        merge_patch(map.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}

/// Resources of kind `R`, keyed by id
///
/// With a [`FileStore`] attached, every create and config change is
/// persisted before it takes effect and every resource file is loaded by
/// [`load_all`](Self::load_all).
pub struct ResourceStorage<R: Resource> {
    resources: DashMap<String, Arc<R>>,
    /// Ids of creates still persisting their file
    reserved: DashMap<String, ()>,
    files: Option<FileStore>,
}

/// Holds an id in `reserved` until dropped
struct Reservation<'a> {
    reserved: &'a DashMap<String, ()>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.id);
    }
}

impl<R: Resource> ResourceStorage<R> {
    /// In-memory storage
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            reserved: DashMap::new(),
            files: None,
        }
    }

    /// Storage persisted as one file per resource under `dir`
    pub fn file_backed(dir: impl AsRef<Path>) -> Self {
        Self {
            resources: DashMap::new(),
            reserved: DashMap::new(),
            files: Some(FileStore::new(dir)),
        }
    }

    pub fn kind(&self) -> &'static str {
        R::KIND
    }

    pub fn files(&self) -> Option<&FileStore> {
        self.files.as_ref()
    }

    fn not_found(id: &str) -> ResourceError {
        ResourceError::NotFound {
            kind: R::KIND,
            id: id.to_string(),
        }
    }

    /// Build runtime members; a failure leaves the resource registered
    /// but `Disconnected`
    async fn bring_up(resource: &R) -> ConnectionStatus {
        match resource.reconstruct().await {
            Ok(()) => {
                resource.core().set_connection(ConnectionStatus::Connected);
                ConnectionStatus::Connected
            }
            Err(e) => {
                warn!(
                    kind = R::KIND,
                    id = %resource.id(),
                    error = %e,
                    "Resource failed to reconstruct"
                );
                resource.core().set_connection(ConnectionStatus::Disconnected);
                resource.on_reconstruct_failed(&e);
                ConnectionStatus::Disconnected
            }
        }
    }

    async fn insert(&self, id: String, config: R::Config) -> ResourceResult<Arc<R>> {
        let resource = Arc::new(R::from_core(ResourceCore::new(
            id.clone(),
            config,
            R::State::default(),
        )));

        match self.resources.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ResourceError::AlreadyExists { kind: R::KIND, id }),
            Entry::Vacant(slot) => {
                slot.insert(resource.clone());
            }
        }

        resource.core().transition(ResourceLifecycle::Loaded)?;
        Self::bring_up(&resource).await;
        Ok(resource)
    }

    /// Create a resource with a fresh id
    pub async fn create(&self, config: R::Config) -> ResourceResult<Arc<R>> {
        self.create_with_id(Ulid::new().to_string(), config).await
    }

    /// Create and persist a resource
    #[instrument(skip(self, id, config), fields(kind = R::KIND))]
    pub async fn create_with_id(
        &self,
        id: impl Into<String>,
        config: R::Config,
    ) -> ResourceResult<Arc<R>> {
        let id = id.into();
        validate_id(&id)?;
        R::validate(&config)?;
        let _reservation = self.reserve(&id)?;

        if let Some(files) = &self.files {
            files.save(&id, &config).await?;
        }

        info!(kind = R::KIND, id = %id, "Creating resource");
        self.insert(id, config).await
    }

    /// Claim `id` for a create, so concurrent creates of the same id cannot
    /// both persist
    fn reserve(&self, id: &str) -> ResourceResult<Reservation<'_>> {
        let already_exists = || ResourceError::AlreadyExists {
            kind: R::KIND,
            id: id.to_string(),
        };
        match self.reserved.entry(id.to_string()) {
            Entry::Occupied(_) => Err(already_exists()),
            Entry::Vacant(slot) => {
                if self.resources.contains_key(id) {
                    return Err(already_exists());
                }
                slot.insert(());
                Ok(Reservation {
                    reserved: &self.reserved,
                    id: id.to_string(),
                })
            }
        }
    }

    /// Register a resource from an already persisted config
    ///
    /// Never fails on reconstruct errors; the resource comes up
    /// `Disconnected` instead.
    pub async fn load(&self, id: impl Into<String>, config: R::Config) -> ResourceResult<Arc<R>> {
        let id = id.into();
        validate_id(&id)?;
        debug!(kind = R::KIND, id = %id, "Loading resource");
        self.insert(id, config).await
    }

    /// Load every persisted resource of this kind
    #[instrument(skip(self), fields(kind = R::KIND))]
    pub async fn load_all(&self) -> ResourceResult<LoadReport> {
        let mut report = LoadReport::default();
        let Some(files) = &self.files else {
            return Ok(report);
        };

        for (id, file) in files.load_all::<R::Config>().await? {
            let loaded = match file {
                Ok(file) => match R::validate(&file.config) {
                    Ok(()) => self.load(id.clone(), file.config).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e.into()),
            };

            match loaded {
                Ok(resource) if resource.core().is_connected() => report.loaded.push(id),
                Ok(_) => report.disconnected.push(id),
                Err(source) => report.failed.push(ResourceLoadError { id, source }),
            }
        }

        info!(
            kind = R::KIND,
            loaded = report.loaded.len(),
            disconnected = report.disconnected.len(),
            failed = report.failed.len(),
            "Loaded resources"
        );
        Ok(report)
    }

    fn live(&self, id: &str) -> ResourceResult<Arc<R>> {
        self.get_by_id(id).ok_or_else(|| Self::not_found(id))
    }

    /// Validate, persist, tear down, swap, reconstruct
    ///
    /// Caller holds the mutation lock.
    async fn swap_config(&self, resource: &R, config: R::Config) -> ResourceResult<ConnectionStatus> {
        if resource.core().lifecycle() == ResourceLifecycle::Deleted {
            return Err(Self::not_found(resource.id()));
        }
        R::validate(&config)?;

        if let Some(files) = &self.files {
            files.save(resource.id(), &config).await?;
        }

        resource.teardown().await;
        resource.core().replace_config(config);
        Ok(Self::bring_up(resource).await)
    }

    /// Replace a resource's config
    #[instrument(skip(self, config), fields(kind = R::KIND))]
    pub async fn set_config(&self, id: &str, config: R::Config) -> ResourceResult<ConnectionStatus> {
        let resource = self.live(id)?;
        let _guard = resource.core().lock_mutation().await;
        self.swap_config(&resource, config).await
    }

    /// Merge a partial JSON object into a resource's config
    ///
    /// A patch that doesn't deserialize leaves the resource untouched.
    #[instrument(skip(self, patch), fields(kind = R::KIND))]
    pub async fn apply_config(&self, id: &str, patch: Value) -> ResourceResult<ConnectionStatus> {
        let resource = self.live(id)?;
        let _guard = resource.core().lock_mutation().await;

        let mut merged = serde_json::to_value(resource.config())
            .map_err(|e| ResourceError::InvalidConfig(e.to_string()))?;
        merge_patch(&mut merged, patch);
        let config: R::Config = serde_json::from_value(merged)
            .map_err(|e| ResourceError::InvalidConfig(e.to_string()))?;

        self.swap_config(&resource, config).await
    }

    /// Remove a resource's file, then tear it down and drop it
    ///
    /// If the file cannot be removed the resource stays live and untouched.
    #[instrument(skip(self), fields(kind = R::KIND))]
    pub async fn delete(&self, id: &str) -> ResourceResult<()> {
        let resource = self.live(id)?;
        let _guard = resource.core().lock_mutation().await;
        if resource.core().lifecycle() == ResourceLifecycle::Deleted {
            return Err(Self::not_found(id));
        }

        if let Some(files) = &self.files {
            files.delete(id).await?;
        }

        resource.teardown().await;
        resource.core().set_connection(ConnectionStatus::Disconnected);
        resource.core().transition(ResourceLifecycle::Deleted)?;
        self.resources.remove(id);

        info!(kind = R::KIND, id = %id, "Deleted resource");
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<R>> {
        self.resources.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// All resources, in id order
    pub fn all(&self) -> Vec<Arc<R>> {
        let mut resources: Vec<_> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        resources.sort_by(|a, b| a.id().cmp(b.id()));
        resources
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.resources.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<R: Resource> Default for ResourceStorage<R> {
    fn default() -> Self {
        Self::new()
    }
}
