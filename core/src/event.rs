//! The Event record that flows through every stage
//!
//! An [`Event`] is one decoded unit of an ingestion request: a destination
//! topic, the raw payload, and the byte offset at which the payload started
//! in its source stream.
//!
//! # Payload sharing
//!
//! ```text
//! Decoder reads a record into Bytes
//!                 │
//!                 ▼
//! Event::clone()  ← bumps the refcount only
//!                 │
//!        ┌────────┴────────┐
//!        ▼                 ▼
//!    original         duplicate (new Bytes, independent buffer)
//! ```
//!
//! Stages that rewrite a payload always build a fresh `Bytes`, so a rewrite
//! never aliases the buffer of the record it was derived from.

use bytes::Bytes;
use std::fmt;

/// Informational payload classification
///
/// Carried along for downstream consumers; no stage branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventType {
    /// Not classified
    #[default]
    Unknown,
    /// Payload is expected to be JSON
    Json,
    /// Opaque payload
    Raw,
}

impl EventType {
    /// Parse a topic `format` string (`json`, `raw`)
    pub fn from_format(format: &str) -> Self {
        match format.to_ascii_lowercase().as_str() {
            "json" => EventType::Json,
            "raw" => EventType::Raw,
            _ => EventType::Unknown,
        }
    }

    /// Lowercase name, as used in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Unknown => "unknown",
            EventType::Json => "json",
            EventType::Raw => "raw",
        }
    }
}

/// A single record with its destination and source offset
#[derive(Clone, PartialEq, Eq)]
pub struct Event {
    /// Logical destination name
    pub topic: String,
    /// Raw record bytes (may be empty)
    pub message: Bytes,
    /// Byte offset of the start of this record within its source stream
    pub offset: u64,
    /// Payload classification
    pub kind: EventType,
}

impl Event {
    /// Create an event with [`EventType::Unknown`]
    pub fn new(topic: impl Into<String>, message: impl Into<Bytes>, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            offset,
            kind: EventType::Unknown,
        }
    }

    /// Builder: set the payload classification
    pub fn with_kind(mut self, kind: EventType) -> Self {
        self.kind = kind;
        self
    }

    /// Build a record derived from this one, routed to `topic` with a new payload.
    ///
    /// `offset` and `kind` are copied. `message` is taken as given and is
    /// expected to be a freshly built buffer, not a view into `self.message`.
    pub fn derive(&self, topic: impl Into<String>, message: Bytes) -> Self {
        Self {
            topic: topic.into(),
            message,
            offset: self.offset,
            kind: self.kind,
        }
    }

    /// True when the record carries no payload bytes
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.message.len()
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn message_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("message", &String::from_utf8_lossy(&self.message))
            .field("offset", &self.offset)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}@{}] {} bytes",
            self.topic,
            self.offset,
            self.message.len()
        )
    }
}
