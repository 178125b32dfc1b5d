//! Error types for schema resolution

use cm_template::TemplateError;
use thiserror::Error;

/// Result type for schema operations
pub type ResolutionResult<T> = Result<T, ConfigResolutionError>;

/// Errors that can occur while resolving a config value against its schema
#[derive(Debug, Clone, Error)]
pub enum ConfigResolutionError {
    /// Required value absent and no default produced one
    #[error("required value missing")]
    MissingRequired,

    /// Value could not be coerced to the declared type
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// Value is not one of the static options
    #[error("{0} is not an allowed option")]
    NotInEnum(String),

    /// Templated value failed to render
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A dynamic type or enumeration resolver failed
    #[error("resolver failed: {0}")]
    Resolver(String),

    /// Failure attributed to a property path
    #[error("property '{path}': {source}")]
    Property {
        path: String,
        #[source]
        source: Box<ConfigResolutionError>,
    },
}

impl ConfigResolutionError {
    /// Build a resolver failure from any displayable error
    pub fn resolver(message: impl std::fmt::Display) -> Self {
        Self::Resolver(message.to_string())
    }

    pub(crate) fn at(self, path: &str) -> Self {
        Self::Property {
            path: path.to_string(),
            source: Box::new(self),
        }
    }
}
