//! Container and volume identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BerthError, BerthResult};

/// A validated container ID.
///
/// Container IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> BerthResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random container ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> BerthResult<()> {
        let invalid = || BerthError::InvalidContainerId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }
        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of a volume record.
///
/// Named volumes use their user-supplied name; anonymous volumes get a
/// generated 64-character hex string. Both share one namespace in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Maximum length of a volume name.
    pub const MAX_LENGTH: usize = 255;

    /// Validate and normalize a user-supplied volume name.
    ///
    /// Surrounding whitespace is trimmed. The result must start with an
    /// ASCII alphanumeric character and contain only `[A-Za-z0-9_.-]`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidMountSpec`] if the name is unusable.
    pub fn named(name: &str) -> BerthResult<Self> {
        let trimmed = name.trim();

        if trimmed.is_empty() {
            return Err(BerthError::invalid_spec(name, "volume name is empty"));
        }
        if trimmed.len() > Self::MAX_LENGTH {
            return Err(BerthError::invalid_spec(
                name,
                format!("volume name exceeds {} bytes", Self::MAX_LENGTH),
            ));
        }
        if !trimmed.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(BerthError::invalid_spec(
                name,
                "volume name must start with a letter or digit",
            ));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(BerthError::invalid_spec(
                name,
                format!("volume name contains invalid character '{bad}'"),
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Generate an identity for an anonymous volume.
    #[must_use]
    pub fn generate() -> Self {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        Self(format!(
            "{}{}",
            hex::encode(a.as_bytes()),
            hex::encode(b.as_bytes())
        ))
    }

    /// Wrap an identity read back from persisted state.
    #[must_use]
    pub fn from_persisted(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the volume ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_container_ids() {
        assert!(ContainerId::new("abc123").is_ok());
        assert!(ContainerId::new("my-container").is_ok());
        assert!(ContainerId::new("my_container").is_ok());
        assert!(ContainerId::new("Container-123_test").is_ok());
    }

    #[test]
    fn invalid_container_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-invalid").is_err());
        assert!(ContainerId::new("_invalid").is_err());
        assert!(ContainerId::new("invalid!").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_container_id() {
        let id1 = ContainerId::generate();
        let id2 = ContainerId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 12);
    }

    #[test]
    fn volume_names_are_trimmed() {
        let id = VolumeId::named("  data ").unwrap();
        assert_eq!(id.as_str(), "data");
    }

    #[test]
    fn invalid_volume_names() {
        for name in ["", "   ", ".hidden", "-x", "a/b", "a:b", "späce"] {
            let err = VolumeId::named(name).unwrap_err();
            assert!(
                matches!(err, BerthError::InvalidMountSpec { .. }),
                "{name:?} should be rejected"
            );
        }
        assert!(VolumeId::named(&"v".repeat(256)).is_err());
    }

    #[test]
    fn generated_volume_ids_are_unique_hex() {
        let a = VolumeId::generate();
        let b = VolumeId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.short().len(), 12);
    }
}
