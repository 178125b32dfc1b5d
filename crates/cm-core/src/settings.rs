//! Key/value settings with change notification
//!
//! Settings feed contextual schema defaults and profile activation. Readers
//! take an explicit snapshot; dependents that derive state from settings
//! subscribe to the change stream.

use crate::ContextData;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A change to a single setting
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Concurrent settings store
pub struct SettingsStore {
    values: DashMap<String, Value>,
    changes: broadcast::Sender<SettingChange>,
}

impl SettingsStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            values: DashMap::new(),
            changes,
        }
    }

    /// Create a store pre-populated from a map
    pub fn from_map(initial: ContextData) -> Self {
        let store = Self::new();
        for (key, value) in initial {
            store.values.insert(key, value);
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Set a value, notifying subscribers if it changed
    ///
    /// Returns the previous value.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        let old_value = self.values.insert(key.clone(), value.clone());

        if old_value.as_ref() != Some(&value) {
            trace!(key = %key, "Setting changed");
            // No receivers is fine
            let _ = self.changes.send(SettingChange {
                key,
                old_value: old_value.clone(),
                new_value: Some(value),
            });
        }

        old_value
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let old_value = self.values.remove(key).map(|(_, v)| v);
        if old_value.is_some() {
            let _ = self.changes.send(SettingChange {
                key: key.to_string(),
                old_value: old_value.clone(),
                new_value: None,
            });
        }
        old_value
    }

    /// Copy of all settings, for template evaluation
    pub fn snapshot(&self) -> ContextData {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for SettingsStore
pub type SharedSettings = Arc<SettingsStore>;
