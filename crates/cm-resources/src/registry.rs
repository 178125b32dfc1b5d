//! Directory of resource storages by kind

use crate::resource::Resource;
use crate::storage::ResourceStorage;
use crate::{ResourceError, ResourceResult};
use cm_schema::ResourceLookup;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Kind-erased view of a [`ResourceStorage`]
pub trait AnyStorage: Send + Sync {
    fn kind(&self) -> &'static str;
    fn contains(&self, id: &str) -> bool;
    fn ids(&self) -> Vec<String>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Resource> AnyStorage for ResourceStorage<R> {
    fn kind(&self) -> &'static str {
        R::KIND
    }

    fn contains(&self, id: &str) -> bool {
        ResourceStorage::contains(self, id)
    }

    fn ids(&self) -> Vec<String> {
        ResourceStorage::ids(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// All resource storages of the runtime
///
/// Resource-typed config properties resolve through this directory, and
/// the satellite host finds storages here.
#[derive(Default)]
pub struct ResourceRegistry {
    storages: DashMap<&'static str, Arc<dyn AnyStorage>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the storage for `R::KIND`
    pub fn register<R: Resource>(&self, storage: Arc<ResourceStorage<R>>) -> ResourceResult<()> {
        if self.storages.contains_key(R::KIND) {
            return Err(ResourceError::KindAlreadyRegistered(R::KIND));
        }
        debug!(kind = R::KIND, "Registering resource storage");
        self.storages.insert(R::KIND, storage);
        Ok(())
    }

    /// Typed storage for `R`
    pub fn storage<R: Resource>(&self) -> Option<Arc<ResourceStorage<R>>> {
        let storage = self.storages.get(R::KIND)?.value().clone();
        storage.into_any().downcast::<ResourceStorage<R>>().ok()
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.storages
            .get(kind)
            .map(|storage| storage.contains(id))
            .unwrap_or(false)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.storages.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }

    /// Ids of every resource of `kind`
    pub fn ids(&self, kind: &str) -> Vec<String> {
        self.storages
            .get(kind)
            .map(|storage| storage.ids())
            .unwrap_or_default()
    }
}

impl ResourceLookup for ResourceRegistry {
    fn contains_resource(&self, kind: &str, id: &str) -> bool {
        self.contains(kind, id)
    }
}

/// Thread-safe wrapper for ResourceRegistry
pub type SharedResourceRegistry = Arc<ResourceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceCore;
    use async_trait::async_trait;

    struct Scene {
        core: ResourceCore<String, ()>,
    }

    #[async_trait]
    impl Resource for Scene {
        const KIND: &'static str = "Scene";
        type Config = String;
        type State = ();

        fn from_core(core: ResourceCore<String, ()>) -> Self {
            Self { core }
        }

        fn core(&self) -> &ResourceCore<String, ()> {
            &self.core
        }
    }

    struct Timer {
        core: ResourceCore<u64, ()>,
    }

    #[async_trait]
    impl Resource for Timer {
        const KIND: &'static str = "Timer";
        type Config = u64;
        type State = ();

        fn from_core(core: ResourceCore<u64, ()>) -> Self {
            Self { core }
        }

        fn core(&self) -> &ResourceCore<u64, ()> {
            &self.core
        }
    }

    #[tokio::test]
    async fn test_typed_lookup() {
        let registry = ResourceRegistry::new();
        let scenes = Arc::new(ResourceStorage::<Scene>::new());
        registry.register(scenes.clone()).unwrap();

        scenes.create_with_id("intro", "Intro".to_string()).await.unwrap();

        let found = registry.storage::<Scene>().unwrap();
        assert!(Arc::ptr_eq(&found, &scenes));
        assert!(registry.storage::<Timer>().is_none());
        assert_eq!(registry.ids("Scene"), vec!["intro"]);
    }

    #[tokio::test]
    async fn test_resource_lookup() {
        let registry = ResourceRegistry::new();
        let scenes = Arc::new(ResourceStorage::<Scene>::new());
        registry.register(scenes.clone()).unwrap();
        scenes.create_with_id("intro", "Intro".to_string()).await.unwrap();

        assert!(registry.contains_resource("Scene", "intro"));
        assert!(!registry.contains_resource("Scene", "outro"));
        assert!(!registry.contains_resource("Timer", "intro"));

        scenes.delete("intro").await.unwrap();
        assert!(!registry.contains_resource("Scene", "intro"));
    }

    #[test]
    fn test_kind_registered_once() {
        let registry = ResourceRegistry::new();
        registry
            .register(Arc::new(ResourceStorage::<Scene>::new()))
            .unwrap();
        registry
            .register(Arc::new(ResourceStorage::<Timer>::new()))
            .unwrap();

        let again = registry.register(Arc::new(ResourceStorage::<Scene>::new()));
        assert!(matches!(again, Err(ResourceError::KindAlreadyRegistered("Scene"))));
        assert_eq!(registry.kinds(), vec!["Scene", "Timer"]);
    }
}
