//! Container identifier validation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HolaError, HolaResult};

/// Length of the abbreviated container ID shown by the Docker CLI.
pub const SHORT_ID_LEN: usize = 12;

/// A validated container reference.
///
/// Clients may address a container by its full hex ID, an abbreviated ID or its
/// name, so the rules are those of Docker names rather than hex digests:
/// - 1-128 characters long
/// - Only ASCII alphanumerics, `-`, `_` and `.`
/// - Starts with an alphanumeric character
///
/// The character set keeps the ID safe to embed in subscription keys
/// (`logs:<id>`) and Docker API paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container reference.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> HolaResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> HolaResult<()> {
        let invalid = || HolaError::InvalidContainerId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

/// Truncate a raw Docker ID to its 12-character short form.
///
/// IDs shorter than that are returned unchanged.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = HolaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
