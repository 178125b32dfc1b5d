//! Context type for tracing the origin of action runs

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies one run of an action sequence and what caused it
///
/// A trigger activation creates a root context; every action invoked by the
/// resulting sequence receives a child context, so log lines can be joined
/// back to the activation that caused them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this run (ULID)
    pub id: String,

    /// What started the run, e.g. "trigger:twitch.chat"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Parent context ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new root context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: None,
            parent_id: None,
        }
    }

    /// Create a root context tagged with its origin
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: Some(origin.into()),
            parent_id: None,
        }
    }

    /// Create a child context that keeps the origin
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            origin: self.origin.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
