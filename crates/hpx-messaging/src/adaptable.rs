//! Structured protocol message independent of transport encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::MessagingResult,
    types::{CORRELATION_ID_HEADER, CorrelationId, Headers},
};

/// A protocol message with a header bag and a body.
///
/// Adaptables are immutable: every `with_*` method returns a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adaptable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    value: Value,
}

impl Adaptable {
    /// Create an adaptable with the given body and no headers.
    pub fn new(value: Value) -> Self {
        Self {
            topic: None,
            headers: Headers::new(),
            value,
        }
    }

    /// Parse an adaptable from its JSON text form.
    pub fn from_json(text: &str) -> MessagingResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize this adaptable to JSON text.
    pub fn to_json(&self) -> MessagingResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Return a copy routed under the given topic.
    #[must_use]
    pub fn with_topic(&self, topic: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.topic = Some(topic.into());
        next
    }

    /// Return a copy with one header set.
    #[must_use]
    pub fn with_header(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.headers.insert(name.into(), value.into());
        next
    }

    /// Return a copy carrying the given correlation id.
    #[must_use]
    pub fn with_correlation_id(&self, id: &CorrelationId) -> Self {
        self.with_header(CORRELATION_ID_HEADER, id.as_str())
    }

    /// The correlation id header, if present.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers
            .get(CORRELATION_ID_HEADER)
            .map(|id| CorrelationId::from(id.as_str()))
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_with_correlation_id_returns_new_value() {
        let original = Adaptable::new(json!({"op": "get"}));
        let id = CorrelationId::from("c-1");
        let tagged = original.with_correlation_id(&id);

        assert!(original.correlation_id().is_none());
        assert_eq!(tagged.correlation_id(), Some(id));
        assert_eq!(tagged.value(), original.value());
    }

    #[test]
    fn test_json_round_trip_keeps_topic_and_headers() {
        let adaptable = Adaptable::new(json!(42))
            .with_topic("things/twin/events")
            .with_header("x-trace", "t1");
        let text = adaptable.to_json().expect("serialize");
        let parsed = Adaptable::from_json(&text).expect("parse");

        assert_eq!(parsed, adaptable);
        assert_eq!(parsed.topic(), Some("things/twin/events"));
        assert_eq!(parsed.header("x-trace"), Some("t1"));
    }

    #[test]
    fn test_from_json_accepts_missing_fields() {
        let parsed = Adaptable::from_json(r#"{"value": "hi"}"#).expect("parse");
        assert!(parsed.headers().is_empty());
        assert!(parsed.topic().is_none());
        assert_eq!(parsed.value(), &json!("hi"));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Adaptable::from_json("not json").is_err());
    }
}
