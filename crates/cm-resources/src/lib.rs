//! Typed, persisted resources
//!
//! A resource is an addressable entity with a persisted config and a
//! transient state, such as a smart plug or a streaming-software
//! connection. Each resource kind has one [`ResourceStorage`] that owns the
//! live instances, persists them through a [`FileStore`] and drives their
//! lifecycle:
//!
//! ```text
//! create/load → reconstruct → (set_config | apply_config)* → delete
//! ```
//!
//! Reconstruct failures never take a resource out of its storage; it stays
//! registered as [`ConnectionStatus::Disconnected`] and its
//! `on_reconstruct_failed` hook schedules recovery.

mod file;
mod lifecycle;
mod registry;
mod resource;
mod storage;

pub use file::{FileStore, ResourceFile, StorageError, StorageResult, RESOURCE_FILE_VERSION};
pub use lifecycle::{ConnectionStatus, InvalidTransition, ResourceLifecycle};
pub use registry::{AnyStorage, ResourceRegistry, SharedResourceRegistry};
pub use resource::{ConnectionHandle, Resource, ResourceCore};
pub use storage::{LoadReport, ResourceStorage};

use thiserror::Error;

/// Result type for resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors that can occur when managing resources
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{kind} resource not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} resource already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid resource id: {0:?}")]
    InvalidId(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An external device or service is unreachable
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("resource kind already registered: {0}")]
    KindAlreadyRegistered(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// A persisted resource that could not be loaded
#[derive(Debug, Error)]
#[error("failed to load resource {id}: {source}")]
pub struct ResourceLoadError {
    pub id: String,
    #[source]
    pub source: ResourceError,
}
