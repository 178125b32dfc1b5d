//! Identity of one configured trigger instance inside a profile

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a trigger instance: the profile it lives in and its id there
///
/// Used as the key for per-instance side state such as cooldowns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerMapping {
    pub profile_id: String,
    pub trigger_id: String,
}

impl TriggerMapping {
    pub fn new(profile_id: impl Into<String>, trigger_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            trigger_id: trigger_id.into(),
        }
    }
}

impl fmt::Display for TriggerMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.profile_id, self.trigger_id)
    }
}
