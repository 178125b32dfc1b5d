//! The `Resource` trait and the core every resource embeds

use crate::lifecycle::{ConnectionStatus, InvalidTransition, ResourceLifecycle};
use crate::{ResourceError, ResourceResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, MutexGuard};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to a resource's connection status
///
/// Lets background reconnect tasks report back without holding the resource.
#[derive(Debug, Clone)]
pub struct ConnectionHandle(Arc<RwLock<ConnectionStatus>>);

impl ConnectionHandle {
    fn new(status: ConnectionStatus) -> Self {
        Self(Arc::new(RwLock::new(status)))
    }

    pub fn get(&self) -> ConnectionStatus {
        *read(&self.0)
    }

    pub fn set(&self, status: ConnectionStatus) {
        *write(&self.0) = status;
    }
}

/// Shared fields of every resource
///
/// Config is persisted; state is transient and rebuilt at runtime.
#[derive(Debug)]
pub struct ResourceCore<C, S> {
    id: String,
    config: RwLock<C>,
    state: RwLock<S>,
    lifecycle: RwLock<ResourceLifecycle>,
    connection: ConnectionHandle,
    /// Serializes set_config, apply_config and delete
    mutation: Mutex<()>,
}

impl<C: Clone, S: Clone> ResourceCore<C, S> {
    pub fn new(id: impl Into<String>, config: C, state: S) -> Self {
        Self {
            id: id.into(),
            config: RwLock::new(config),
            state: RwLock::new(state),
            lifecycle: RwLock::new(ResourceLifecycle::Uninitialized),
            connection: ConnectionHandle::new(ConnectionStatus::Disconnected),
            mutation: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current config
    pub fn config(&self) -> C {
        read(&self.config).clone()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> S {
        read(&self.state).clone()
    }

    pub fn set_state(&self, state: S) {
        *write(&self.state) = state;
    }

    pub fn update_state(&self, update: impl FnOnce(&mut S)) {
        update(&mut write(&self.state));
    }

    pub fn lifecycle(&self) -> ResourceLifecycle {
        *read(&self.lifecycle)
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection.get()
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection() == ConnectionStatus::Connected
    }

    /// Record the outcome of a (re)connect attempt
    pub fn set_connection(&self, status: ConnectionStatus) {
        self.connection.set(status);
    }

    pub(crate) fn replace_config(&self, config: C) {
        *write(&self.config) = config;
    }

    pub(crate) fn transition(&self, to: ResourceLifecycle) -> Result<(), InvalidTransition> {
        let mut lifecycle = write(&self.lifecycle);
        *lifecycle = lifecycle.try_transition(to)?;
        Ok(())
    }

    pub(crate) async fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().await
    }
}

/// A persisted, addressable entity managed by a [`ResourceStorage`]
///
/// Runtime members that cannot be serialized (open connections, pollers)
/// live in the implementing type and are built by [`Resource::reconstruct`]
/// from the current config. The storage calls `teardown` before every
/// config swap and `reconstruct` after it.
///
/// [`ResourceStorage`]: crate::ResourceStorage
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Resource kind, unique across the runtime (e.g. "Plug")
    const KIND: &'static str;

    type Config: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type State: Clone + Default + Send + Sync + 'static;

    fn from_core(core: ResourceCore<Self::Config, Self::State>) -> Self
    where
        Self: Sized;

    fn core(&self) -> &ResourceCore<Self::Config, Self::State>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn config(&self) -> Self::Config {
        self.core().config()
    }

    /// Reject a config before it is persisted or applied
    fn validate(_config: &Self::Config) -> ResourceResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }

    /// Build runtime members from the current config
    async fn reconstruct(&self) -> ResourceResult<()> {
        Ok(())
    }

    /// Drop runtime members
    async fn teardown(&self) {}

    /// Called when `reconstruct` failed; typically schedules a retry
    fn on_reconstruct_failed(&self, _error: &ResourceError) {}
}
