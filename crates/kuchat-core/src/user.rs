//! User identity as seen by the routing core.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DomainError, DomainResult};

/// Maximum accepted length of a user identifier, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Opaque identifier of an authenticated user.
///
/// Supplied by the external auth collaborator at connect time; the core
/// only compares it. Deserializes from either a JSON string or a JSON
/// integer because the chat application keys users by numeric database ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a UserId without validation.
    ///
    /// Use [`UserId::parse`] for untrusted input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses and validates a user identifier.
    ///
    /// Surrounding whitespace is trimmed. The result must be non-empty and
    /// no longer than [`MAX_USER_ID_LEN`] bytes.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::InvalidUserId {
                value: raw.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if trimmed.len() > MAX_USER_ID_LEN {
            return Err(DomainError::InvalidUserId {
                value: trimmed.chars().take(32).collect(),
                reason: format!("longer than {MAX_USER_ID_LEN} bytes"),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => UserId::parse(&s).map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(UserId::from(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let id = UserId::parse("  42 ").unwrap();
        assert_eq!(id.as_str(), "42");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("   ").is_err());
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let long = "x".repeat(MAX_USER_ID_LEN + 1);
        let err = UserId::parse(&long).unwrap_err();
        assert!(err.to_string().contains("longer than"));
    }

    #[test]
    fn test_deserialize_string_and_number() {
        let from_str: UserId = serde_json::from_str("\"alice\"").unwrap();
        let from_num: UserId = serde_json::from_str("17").unwrap();
        assert_eq!(from_str, UserId::new("alice"));
        assert_eq!(from_num, UserId::new("17"));
    }

    #[test]
    fn test_deserialize_rejects_blank_string() {
        let result: Result<UserId, _> = serde_json::from_str("\"  \"");
        assert!(result.is_err());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&UserId::from(7u64)).unwrap();
        assert_eq!(json, "\"7\"");
    }
}
