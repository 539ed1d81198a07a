//! edgeproxy-core - Event model and stage protocol for the edge ingestion proxy
//!
//! This crate holds the types shared by every part of the proxy:
//!
//! - [`Event`] - one decoded record (topic, payload, source offset)
//! - [`EventType`] - informational payload classification
//! - [`EventStage`] - the pull-based iterator contract every decoder and
//!   transform implements
//! - [`StageError`] - the terminal error carried on a stage stream
//! - [`VecStage`] - an in-memory source stage
//!
//! The gateway crate builds decoders, transforms and transports on top of
//! these. Transform stages written outside the gateway only need this crate.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// The Event record
pub mod event;
/// Pull-based stage protocol
pub mod stage;

pub use error::StageError;
pub use event::{Event, EventType};
pub use stage::{collect, EventStage, VecStage};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io;

    // ==========================================================================
    // StageError Tests
    // ==========================================================================

    #[test]
    fn test_stage_error_read_display() {
        let err = StageError::read(7, &io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(err.to_string(), "read failed at offset 7: short");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_stage_error_aborted_display() {
        let err = StageError::Aborted("schema reload".to_string());
        assert_eq!(err.to_string(), "stage aborted: schema reload");
        assert_eq!(err.io_kind(), None);
    }

    #[test]
    fn test_stage_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StageError>();
    }

    // ==========================================================================
    // Event Tests
    // ==========================================================================

    #[test]
    fn test_event_new_defaults_to_unknown() {
        let event = Event::new("test", "payload", 3);
        assert_eq!(event.topic, "test");
        assert_eq!(event.message, Bytes::from_static(b"payload"));
        assert_eq!(event.offset, 3);
        assert_eq!(event.kind, EventType::Unknown);
        assert_eq!(event.len(), 7);
    }

    #[test]
    fn test_event_empty_message() {
        let event = Event::new("test", Bytes::new(), 0);
        assert!(event.is_empty());
        assert_eq!(event.message_str(), Some(""));
    }

    #[test]
    fn test_event_derive_copies_offset_and_kind() {
        let original = Event::new("src", r#"{"a":1}"#, 40).with_kind(EventType::Json);
        let derived = original.derive("dst", Bytes::from_static(br#"{"a":1,"b":2}"#));

        assert_eq!(derived.topic, "dst");
        assert_eq!(derived.offset, 40);
        assert_eq!(derived.kind, EventType::Json);
        // the original is untouched
        assert_eq!(original.topic, "src");
        assert_eq!(original.message, Bytes::from_static(br#"{"a":1}"#));
    }

    #[test]
    fn test_event_type_from_format() {
        assert_eq!(EventType::from_format("json"), EventType::Json);
        assert_eq!(EventType::from_format("JSON"), EventType::Json);
        assert_eq!(EventType::from_format("raw"), EventType::Raw);
        assert_eq!(EventType::from_format("csv"), EventType::Unknown);
        assert_eq!(EventType::Json.as_str(), "json");
    }

    #[test]
    fn test_event_display() {
        let event = Event::new("clicks", "abc", 12);
        assert_eq!(event.to_string(), "[clicks@12] 3 bytes");
    }

    // ==========================================================================
    // VecStage Tests
    // ==========================================================================

    #[test]
    fn test_vec_stage_yields_in_order() {
        let mut stage = VecStage::new(vec![Event::new("t", "a", 0), Event::new("t", "b", 2)]);
        assert!(stage.current().is_none());

        assert!(stage.advance());
        assert_eq!(stage.current().unwrap().message, Bytes::from_static(b"a"));
        assert!(stage.advance());
        assert_eq!(stage.current().unwrap().message, Bytes::from_static(b"b"));
        assert!(!stage.advance());
        assert!(stage.error().is_none());
        // stays finished
        assert!(!stage.advance());
    }

    #[test]
    fn test_vec_stage_terminal_error() {
        let err = StageError::Aborted("boom".into());
        let mut stage = VecStage::new(vec![Event::new("t", "a", 0)]).with_error(err.clone());

        assert!(stage.advance());
        assert!(stage.error().is_none());
        assert!(!stage.advance());
        assert_eq!(stage.error(), Some(&err));
    }

    #[test]
    fn test_collect_through_box() {
        let mut stage: Box<dyn EventStage> =
            Box::new(VecStage::new(vec![Event::new("t", "x", 0), Event::new("t", "y", 1)]));
        assert_eq!(stage.name(), "vec");

        let (events, err) = collect(&mut stage);
        assert_eq!(events.len(), 2);
        assert!(err.is_none());
    }
}
