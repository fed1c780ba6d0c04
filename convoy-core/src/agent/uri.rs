//! Agent addressing
//!
//! Every agent is addressed as `scheme://identifier`; the scheme selects the
//! owning family.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConvoyError, Result};

const SEPARATOR: &str = "://";

/// Opaque agent identifier of the form `scheme://identifier`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentUri {
    raw: String,
    scheme_len: usize,
}

impl AgentUri {
    /// Parse and validate an agent URI
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ConvoyError::InvalidAgentUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, identifier) = raw
            .split_once(SEPARATOR)
            .ok_or_else(|| invalid("missing '://' separator"))?;

        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
        {
            return Err(invalid("scheme must be lowercase alphanumeric, '+', '.' or '-'"));
        }
        if identifier.is_empty() {
            return Err(invalid("empty identifier"));
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme_len: scheme.len(),
        })
    }

    /// Build a URI from its parts
    pub fn new(scheme: &str, identifier: &str) -> Result<Self> {
        Self::parse(&format!("{}{}{}", scheme, SEPARATOR, identifier))
    }

    /// The scheme segment, which selects the owning family
    pub fn scheme(&self) -> &str {
        &self.raw[..self.scheme_len]
    }

    /// The identifier segment
    pub fn identifier(&self) -> &str {
        &self.raw[self.scheme_len + SEPARATOR.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for AgentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for AgentUri {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for AgentUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for AgentUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AgentUri::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_scheme_and_identifier() {
        let uri = AgentUri::parse("fake://one").unwrap();
        assert_eq!(uri.scheme(), "fake");
        assert_eq!(uri.identifier(), "one");
        assert_eq!(uri.to_string(), "fake://one");
    }

    #[test]
    fn test_identifier_may_contain_separator() {
        let uri = AgentUri::parse("outbox://db://tenant-a").unwrap();
        assert_eq!(uri.scheme(), "outbox");
        assert_eq!(uri.identifier(), "db://tenant-a");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(AgentUri::parse("no-separator").is_err());
        assert!(AgentUri::parse("://one").is_err());
        assert!(AgentUri::parse("fake://").is_err());
        assert!(AgentUri::parse("Fake://one").is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = AgentUri::parse("fake://a").unwrap();
        let b = AgentUri::parse("fake://b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let uri = AgentUri::parse("fake://one").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"fake://one\"");

        let back: AgentUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
        assert!(serde_json::from_str::<AgentUri>("\"broken\"").is_err());
    }
}
