//! Triggers, activation profiles and the fire pipeline
//!
//! Event sources call [`TriggerHandle::fire`] with a context payload. The
//! registry evaluates every instance of that trigger in the currently active
//! profiles and hands each match to a [`SequenceDispatcher`]. A failing or
//! panicking instance is logged and counted; its siblings still run.

mod builtin;
mod command;
mod cooldown;
mod definition;
mod profile;
mod registry;

pub use builtin::{command_trigger, register_core_triggers};
pub use command::{CommandArg, CommandPattern};
pub use cooldown::CooldownTable;
pub use definition::{
    ContextSchemaFn, HandleArgs, HandleFuture, HandleOutcome, TriggerDefinition, TriggerHandler,
};
pub use profile::{
    Profile, ProfileManager, ProfileSnapshot, ProfilesChangedFn, SharedProfileManager,
    TriggerInstance,
};
pub use registry::{
    Activation, FireReport, NoopDispatcher, SequenceDispatcher, SharedTriggerRegistry,
    TriggerHandle, TriggerRegistry,
};

use cm_core::{QualifiedId, QualifiedIdError, TriggerMapping};
use cm_schema::ConfigResolutionError;
use thiserror::Error;

/// Result type for trigger operations
pub type TriggerResult<T> = Result<T, TriggerError>;

/// Errors that can occur when defining or firing triggers
#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    #[error("trigger not found: {0}")]
    NotFound(QualifiedId),

    #[error("trigger already defined: {0}")]
    AlreadyDefined(QualifiedId),

    #[error(transparent)]
    InvalidId(#[from] QualifiedIdError),

    #[error("invalid config for {mapping}: {source}")]
    InvalidConfig {
        mapping: TriggerMapping,
        #[source]
        source: ConfigResolutionError,
    },

    #[error("trigger {mapping} failed: {message}")]
    Handle {
        mapping: TriggerMapping,
        message: String,
    },

    #[error("trigger {mapping} panicked: {message}")]
    Panicked {
        mapping: TriggerMapping,
        message: String,
    },

    /// Raised by handlers; wrapped into `Handle` by the registry
    #[error("{0}")]
    Failed(String),

    #[error("invalid command pattern: {0}")]
    InvalidPattern(String),

    #[error("duplicate profile id: {0}")]
    DuplicateProfile(String),

    #[error("duplicate trigger instance: {0}")]
    DuplicateTrigger(TriggerMapping),
}

impl TriggerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        TriggerError::Failed(message.to_string())
    }
}
