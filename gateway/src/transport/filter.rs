//! JSON validation filter shared by all transports
//!
//! A record on a topic flagged for validation whose payload is not
//! well-formed JSON is rerouted instead of dropped:
//!
//! ```text
//! topic:   events                 topic:   malformed
//! message: {"a":1           ──►   message: events\t{"a":1
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use edgeproxy_core::Event;
use parking_lot::RwLock;
use serde::de::IgnoredAny;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of filtering one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    /// The record to forward
    pub event: Event,
    /// True when the record was rerouted to the invalid messages topic
    pub rerouted: bool,
}

/// Reroutes malformed JSON on validated topics
///
/// The topic map is replaced as a whole; readers work on a snapshot.
pub struct JsonValidationFilter {
    topics: RwLock<Arc<HashMap<String, bool>>>,
    invalid_topic: String,
}

impl JsonValidationFilter {
    /// Create a filter that reroutes to `invalid_topic`
    pub fn new(invalid_topic: impl Into<String>) -> Self {
        Self {
            topics: RwLock::new(Arc::new(HashMap::new())),
            invalid_topic: invalid_topic.into(),
        }
    }

    /// Destination of rerouted records
    pub fn invalid_topic(&self) -> &str {
        &self.invalid_topic
    }

    /// Replace the set of validated topics
    pub fn set_topics(&self, topics: HashMap<String, bool>) {
        *self.topics.write() = Arc::new(topics);
    }

    /// Copy of the current validation map
    pub fn topics(&self) -> HashMap<String, bool> {
        self.topics.read().as_ref().clone()
    }

    /// True when records of `topic` must be well-formed JSON
    pub fn validates(&self, topic: &str) -> bool {
        self.topics.read().get(topic).copied().unwrap_or(false)
    }

    /// Filter one record
    pub fn apply(&self, event: Event) -> Filtered {
        if !self.validates(&event.topic) || is_json(&event.message) {
            return Filtered {
                event,
                rerouted: false,
            };
        }

        Filtered {
            event: reroute(&event, &self.invalid_topic),
            rerouted: true,
        }
    }
}

/// Copy of `event` addressed to `invalid_topic` as `topic\tmessage`
pub fn reroute(event: &Event, invalid_topic: &str) -> Event {
    let mut message = BytesMut::with_capacity(event.topic.len() + 1 + event.message.len());
    message.put_slice(event.topic.as_bytes());
    message.put_u8(b'\t');
    message.put_slice(&event.message);
    event.derive(invalid_topic, message.freeze())
}

/// Well-formedness check without building a value tree
pub fn is_json(message: &Bytes) -> bool {
    serde_json::from_slice::<IgnoredAny>(message).is_ok()
}
