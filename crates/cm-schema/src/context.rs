//! Explicit inputs available to resolvers

use cm_core::{ContextData, SettingsStore, SharedSettings};
use serde_json::Value;
use std::sync::Arc;

/// Lookup used to resolve resource-typed properties by id
pub trait ResourceLookup: Send + Sync {
    /// Whether a live resource of `kind` with `id` exists
    fn contains_resource(&self, kind: &str, id: &str) -> bool;
}

/// Everything a default, enumeration or dynamic type resolver may read
///
/// Resolvers receive this explicitly instead of reaching for globals, so a
/// resolution is reproducible from its inputs.
#[derive(Clone)]
pub struct ResolveContext {
    /// Trigger context data visible to templates
    pub data: Arc<ContextData>,
    /// Ambient settings
    pub settings: SharedSettings,
    /// Resource directory for resource-typed properties
    pub resources: Option<Arc<dyn ResourceLookup>>,
}

impl ResolveContext {
    pub fn new(data: ContextData, settings: SharedSettings) -> Self {
        Self {
            data: Arc::new(data),
            settings,
            resources: None,
        }
    }

    /// Context with no data and empty settings
    pub fn empty() -> Self {
        Self::new(ContextData::new(), Arc::new(SettingsStore::new()))
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceLookup>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Same settings and resources, different data
    pub fn with_data(&self, data: ContextData) -> Self {
        Self {
            data: Arc::new(data),
            settings: self.settings.clone(),
            resources: self.resources.clone(),
        }
    }

    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings.get(key)
    }
}

impl std::fmt::Debug for ResolveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveContext")
            .field("data", &self.data)
            .field("has_resources", &self.resources.is_some())
            .finish()
    }
}
