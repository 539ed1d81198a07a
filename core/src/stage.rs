//! Pull-based stage protocol
//!
//! Every decoder and transform implements [`EventStage`]. Stages are chained
//! by wrapping: each stage owns its upstream and pulls one record at a time.
//!
//! ```text
//! Decoder ──► SelectorStage ──► Anonymizer ──► ... ──► Transport
//!    ▲              │
//!    └── advance() ─┘   (one logical thread drives the whole chain)
//! ```

use crate::error::StageError;
use crate::event::Event;
use std::collections::VecDeque;

/// A finite, single-pass, pull-based sequence of [`Event`]s
///
/// # Contract
///
/// - `advance()` moves to the next record and returns `true` while one is
///   available. It returns `false` exactly once, when the sequence is over;
///   calls after that keep returning `false`.
/// - `current()` is the record the last successful `advance()` produced.
///   It is `None` before the first call.
/// - `error()` is the terminal state once `advance()` returned `false`:
///   `None` means a clean end-of-stream. It may become `Some` earlier, on the
///   call that returns the final record.
///
/// Stages keep unsynchronized state and must be driven from one logical
/// thread of control at a time. The `Send` bound lets a whole chain move
/// into a task.
///
/// # Example
///
/// ```
/// use edgeproxy_core::{Event, EventStage, StageError};
///
/// /// Drops records with an empty payload
/// struct SkipEmpty<S> {
///     upstream: S,
/// }
///
/// impl<S: EventStage> EventStage for SkipEmpty<S> {
///     fn name(&self) -> &'static str {
///         "skip_empty"
///     }
///
///     fn advance(&mut self) -> bool {
///         while self.upstream.advance() {
///             if self.upstream.current().is_some_and(|e| !e.is_empty()) {
///                 return true;
///             }
///         }
///         false
///     }
///
///     fn current(&self) -> Option<&Event> {
///         self.upstream.current()
///     }
///
///     fn error(&self) -> Option<&StageError> {
///         self.upstream.error()
///     }
/// }
/// ```
pub trait EventStage: Send {
    /// Short name for logs and metrics ("decoder", "selector", ...)
    fn name(&self) -> &'static str;

    /// Move to the next record
    fn advance(&mut self) -> bool;

    /// The record produced by the last successful `advance()`
    fn current(&self) -> Option<&Event>;

    /// Terminal error, `None` on clean end-of-stream
    fn error(&self) -> Option<&StageError>;
}

impl<S: EventStage + ?Sized> EventStage for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn advance(&mut self) -> bool {
        (**self).advance()
    }

    fn current(&self) -> Option<&Event> {
        (**self).current()
    }

    fn error(&self) -> Option<&StageError> {
        (**self).error()
    }
}

impl<S: EventStage + ?Sized> EventStage for &mut S {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn advance(&mut self) -> bool {
        (**self).advance()
    }

    fn current(&self) -> Option<&Event> {
        (**self).current()
    }

    fn error(&self) -> Option<&StageError> {
        (**self).error()
    }
}

/// Drain a stage into a vector, returning the records and the terminal error
pub fn collect<S: EventStage + ?Sized>(stage: &mut S) -> (Vec<Event>, Option<StageError>) {
    let mut events = Vec::new();
    while stage.advance() {
        if let Some(event) = stage.current() {
            events.push(event.clone());
        }
    }
    (events, stage.error().cloned())
}

/// In-memory source stage
///
/// Yields a prepared list of records, then ends with an optional error.
/// Useful when records were produced by something other than a byte
/// decoder, and in tests.
#[derive(Debug, Default)]
pub struct VecStage {
    queue: VecDeque<Event>,
    current: Option<Event>,
    terminal: Option<StageError>,
    error: Option<StageError>,
    finished: bool,
}

impl VecStage {
    /// Create a stage that yields `events` in order, then ends cleanly
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        Self {
            queue: events.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Builder: end with `error` instead of a clean end-of-stream
    pub fn with_error(mut self, error: StageError) -> Self {
        self.terminal = Some(error);
        self
    }

    /// Records not yet yielded
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl EventStage for VecStage {
    fn name(&self) -> &'static str {
        "vec"
    }

    fn advance(&mut self) -> bool {
        if self.finished {
            return false;
        }
        match self.queue.pop_front() {
            Some(event) => {
                self.current = Some(event);
                true
            }
            None => {
                self.finished = true;
                self.error = self.terminal.take();
                false
            }
        }
    }

    fn current(&self) -> Option<&Event> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&StageError> {
        self.error.as_ref()
    }
}
