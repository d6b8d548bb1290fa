//! Error types shared across deadend crates.

use thiserror::Error;

pub use crate::ids::IdError;
pub use crate::secret::SecretError;

/// A result type using `ConfigError`.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while assembling or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable holds a value of the wrong type.
    #[error("environment variable {var} has invalid value {value:?}")]
    Parse {
        /// The variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A configuration field failed validation.
    #[error("invalid configuration {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
