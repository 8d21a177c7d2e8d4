//! Core identifier types.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Header bag carried by adaptables and outbound messages.
pub type Headers = BTreeMap<String, String>;

/// Header under which the correlation id travels.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Unique identifier for request-response correlation.
/// Uses ULID for lexicographically sortable, unique IDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation ID using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key under which a subscription message is registered for replay.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Create a new key from a string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubscriptionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_uniqueness() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_correlation_id_from_str() {
        let id: CorrelationId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(format!("{id}"), "test-id");
    }

    #[test]
    fn test_correlation_id_serializes_as_string() {
        let id = CorrelationId::from("c-1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"c-1\"");
    }

    #[test]
    fn test_subscription_key_from_string() {
        let key: SubscriptionKey = String::from("sub-1").into();
        assert_eq!(key.as_str(), "sub-1");
        assert_eq!(key.to_string(), "sub-1");
    }
}
