//! Qualified ID type representing a plugin.id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid qualified IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QualifiedIdError {
    #[error("qualified id must be '<plugin>.<id>'")]
    InvalidFormat,

    #[error("plugin cannot be empty")]
    EmptyPlugin,

    #[error("id cannot be empty")]
    EmptyId,

    #[error("plugin must be lowercase alphanumeric with '_' or '-'")]
    InvalidPluginChars,

    #[error("id must be alphanumeric with '_' or '-'")]
    InvalidIdChars,
}

/// Registry key for actions and triggers (e.g., "twitch.chat")
///
/// Ids only need to be unique inside their plugin namespace; the pair is
/// globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedId {
    plugin: String,
    id: String,
}

impl QualifiedId {
    /// Create a new QualifiedId from its parts
    pub fn new(plugin: impl Into<String>, id: impl Into<String>) -> Result<Self, QualifiedIdError> {
        let plugin = plugin.into();
        let id = id.into();

        if plugin.is_empty() {
            return Err(QualifiedIdError::EmptyPlugin);
        }
        if id.is_empty() {
            return Err(QualifiedIdError::EmptyId);
        }
        if !plugin
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(QualifiedIdError::InvalidPluginChars);
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(QualifiedIdError::InvalidIdChars);
        }

        Ok(Self { plugin, id })
    }

    /// Plugin namespace
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Id inside the plugin namespace
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for QualifiedId {
    type Err = QualifiedIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((plugin, id)) if !id.contains('.') => Self::new(plugin, id),
            _ => Err(QualifiedIdError::InvalidFormat),
        }
    }
}

impl TryFrom<String> for QualifiedId {
    type Error = QualifiedIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<QualifiedId> for String {
    fn from(id: QualifiedId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plugin, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let id: QualifiedId = "iot.plug".parse().unwrap();
        assert_eq!(id.plugin(), "iot");
        assert_eq!(id.id(), "plug");
        assert_eq!(id.to_string(), "iot.plug");
    }

    #[test]
    fn test_camel_case_id_allowed() {
        let id: QualifiedId = "twitch.channelPointReward".parse().unwrap();
        assert_eq!(id.id(), "channelPointReward");
    }

    #[test]
    fn test_invalid() {
        assert_eq!(
            "noseparator".parse::<QualifiedId>(),
            Err(QualifiedIdError::InvalidFormat)
        );
        assert_eq!(
            "a.b.c".parse::<QualifiedId>(),
            Err(QualifiedIdError::InvalidFormat)
        );
        assert_eq!(
            ".plug".parse::<QualifiedId>(),
            Err(QualifiedIdError::EmptyPlugin)
        );
        assert_eq!("iot.".parse::<QualifiedId>(), Err(QualifiedIdError::EmptyId));
        assert_eq!(
            "IoT.plug".parse::<QualifiedId>(),
            Err(QualifiedIdError::InvalidPluginChars)
        );
        assert_eq!(
            "iot.pl ug".parse::<QualifiedId>(),
            Err(QualifiedIdError::InvalidIdChars)
        );
    }

    #[test]
    fn test_serde_as_string() {
        let id = QualifiedId::new("time", "delay").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"time.delay\"");

        let back: QualifiedId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<QualifiedId>("\"bad\"").is_err());
    }
}
