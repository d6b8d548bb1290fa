//! Device identity.
//!
//! A device is addressed by the namespace it lives in and its resource name.
//! The textual form used on the command line and in logs is `namespace/name`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a device resource record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    namespace: String,
    name: String,
}

impl DeviceKey {
    /// Create a new `DeviceKey`.
    ///
    /// # Errors
    ///
    /// Returns an error if either component is empty or contains a `/`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();

        if namespace.is_empty() {
            return Err(IdError::Empty("namespace"));
        }
        if name.is_empty() {
            return Err(IdError::Empty("name"));
        }
        if namespace.contains('/') || name.contains('/') {
            return Err(IdError::InvalidFormat(format!("{namespace}/{name}")));
        }

        Ok(Self { namespace, name })
    }

    /// The namespace the device lives in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The device resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey({}/{})", self.namespace, self.name)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for DeviceKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| IdError::InvalidFormat(s.to_string()))?;
        Self::new(namespace, name)
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// A required component was empty.
    #[error("device {0} must not be empty")]
    Empty(&'static str),

    /// The input is not of the form `namespace/name`.
    #[error("invalid device reference {0:?}: expected namespace/name")]
    InvalidFormat(String),
}
