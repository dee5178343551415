//! Layer keys and tag names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{NobyError, NobyResult};

/// Reserved name of the empty base.
pub const SCRATCH: &str = "scratch";

/// A validated layer key.
///
/// Layer keys are lowercase hex-encoded SHA-256 digests (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerKey(String);

impl LayerKey {
    /// Length of a hex-encoded key.
    pub const LENGTH: usize = 64;

    /// Create a layer key, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not 64 lowercase hex characters.
    pub fn new(key: impl Into<String>) -> NobyResult<Self> {
        let key = key.into();
        if Self::is_valid(&key) {
            Ok(Self(key))
        } else {
            Err(NobyError::InvalidLayerKey { key })
        }
    }

    /// Build a key from a finished hasher.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Whether `key` looks like a layer key.
    #[must_use]
    pub fn is_valid(key: &str) -> bool {
        key.len() == Self::LENGTH
            && key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the key (first 16 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerKey {
    type Err = NobyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LayerKey {
    type Error = NobyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LayerKey> for String {
    fn from(key: LayerKey) -> Self {
        key.0
    }
}

impl AsRef<str> for LayerKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated tag name.
///
/// Tag names must:
/// - Be 1-128 characters long
/// - Contain only alphanumerics and `_ . : / -`
/// - Start with an alphanumeric character
/// - Not be the reserved name `scratch`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagName(String);

impl TagName {
    /// Maximum length of a tag.
    pub const MAX_LENGTH: usize = 128;

    /// Create a tag name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(tag: impl Into<String>) -> NobyResult<Self> {
        let tag = tag.into();
        Self::validate(&tag)?;
        Ok(Self(tag))
    }

    /// Get the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(tag: &str) -> NobyResult<()> {
        let invalid = || NobyError::InvalidTag {
            tag: tag.to_string(),
        };

        if tag.is_empty() || tag.len() > Self::MAX_LENGTH || tag == SCRATCH {
            return Err(invalid());
        }

        if !tag.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TagName {
    type Err = NobyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TagName {
    type Error = NobyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TagName> for String {
    fn from(tag: TagName) -> Self {
        tag.0
    }
}
