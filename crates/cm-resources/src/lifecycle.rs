//! Resource lifecycle
//!
//! ```text
//! Uninitialized → Loaded → Deleted
//!              ↘ Deleted
//! ```
//!
//! Config changes keep a resource `Loaded`; only the connection status
//! reflects whether runtime members came up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLifecycle {
    /// Constructed, runtime members not built yet
    Uninitialized,
    /// Registered in its storage
    Loaded,
    /// Removed from storage; terminal
    Deleted,
}

/// Whether a resource's runtime members (connections, clients) are up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Error when an invalid lifecycle transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid lifecycle transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ResourceLifecycle,
    pub to: ResourceLifecycle,
    pub reason: &'static str,
}

impl ResourceLifecycle {
    /// Attempt a transition, returning the new state if valid
    pub fn try_transition(self, to: ResourceLifecycle) -> Result<ResourceLifecycle, InvalidTransition> {
        use ResourceLifecycle::*;

        let valid = matches!(
            (self, to),
            (Uninitialized, Loaded) | (Uninitialized, Deleted) | (Loaded, Deleted)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: ResourceLifecycle) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ResourceLifecycle, to: ResourceLifecycle) -> &'static str {
        use ResourceLifecycle::*;

        match (from, to) {
            (Deleted, _) => "Deleted is terminal",
            (Loaded, Loaded) => "already loaded",
            (Loaded, Uninitialized) => "loaded resources reconfigure in place",
            _ => "invalid lifecycle transition",
        }
    }
}
