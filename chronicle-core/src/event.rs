//! Value types that flow through the engine.
//!
//! Commands and domain events are plain data: a name plus a JSON payload.
//! Persisted events ([`AggregateEvent`]) add the log coordinates assigned by
//! the store. None of these types carry behaviour; aggregates, stores and
//! projections interpret them by name.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one aggregate instance, and therefore of one event stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId {
    /// Aggregate type name, e.g. `"counter"`.
    pub name: String,
    /// Instance identifier within that type.
    pub id: String,
}

impl AggregateId {
    #[must_use]
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Stream identifier used by the append-only store: `name:id`.
    #[must_use]
    pub fn stream_id(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// An intent addressed to an aggregate. Commands are never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Command {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            metadata: None,
        }
    }

    /// Attach metadata (correlation ids, user, ...) that is stored alongside
    /// the events the command produces.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A fact produced by a command handler, not yet persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DomainEvent {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
        }
    }

    /// An event without a payload.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    /// Payload field lookup, `Value::Null` when absent.
    #[must_use]
    pub fn field(&self, key: &str) -> &Value {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .unwrap_or(&Value::Null)
    }
}

/// A domain event as read back from the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateEvent {
    /// Global sequence number, shared by every stream.
    pub id: u64,
    pub aggregate: AggregateId,
    /// 1-based position within the aggregate's own stream.
    pub version: u64,
    /// Milliseconds since the Unix epoch at append time.
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: DomainEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AggregateEvent {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.event.name
    }

    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.event.data.as_ref()
    }

    /// Routing key used by projections: `aggregate.event`, lower-cased.
    #[must_use]
    pub fn event_type(&self) -> String {
        format!("{}.{}", self.aggregate.name, self.event.name).to_lowercase()
    }
}

impl Borrow<DomainEvent> for AggregateEvent {
    fn borrow(&self) -> &DomainEvent {
        &self.event
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stream_id_joins_name_and_id() {
        let id = AggregateId::new("counter", "c1");
        assert_eq!(id.stream_id(), "counter:c1");
        assert_eq!(id.to_string(), "counter:c1");
    }

    #[test]
    fn event_type_is_lower_cased() {
        let event = AggregateEvent {
            id: 1,
            aggregate: AggregateId::new("Counter", "c1"),
            version: 1,
            timestamp: 0,
            event: DomainEvent::new("ValueSet", json!({"to": 3})),
            metadata: None,
        };
        assert_eq!(event.event_type(), "counter.valueset");
    }

    #[test]
    fn aggregate_event_serializes_flat() {
        let event = AggregateEvent {
            id: 7,
            aggregate: AggregateId::new("counter", "c1"),
            version: 2,
            timestamp: 1_700_000_000_000,
            event: DomainEvent::new("incremented", json!({"by": 1})),
            metadata: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["name"], "incremented");
        assert_eq!(value["data"]["by"], 1);
        assert!(value.get("metadata").is_none());

        let back: AggregateEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn field_defaults_to_null() {
        let event = DomainEvent::bare("incremented");
        assert_eq!(event.field("by"), &Value::Null);
    }
}
