//! Errors carried on the stage stream

use std::io;
use thiserror::Error;

/// Terminal error of an [`EventStage`](crate::EventStage)
///
/// Stages report failures through `error()` instead of returning them from
/// `advance()`, so the type is cheap to clone and compare. The underlying
/// `io::Error` is flattened to its kind and message for that reason.
///
/// # Example
///
/// ```
/// use edgeproxy_core::StageError;
/// use std::io;
///
/// let err = StageError::read(42, &io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
/// assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
/// assert_eq!(err.to_string(), "read failed at offset 42: peer gone");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The underlying byte source failed
    ///
    /// `offset` is the stream position at which the failing read started.
    #[error("read failed at offset {offset}: {message}")]
    Read {
        /// Stream offset of the failed read
        offset: u64,
        /// Kind of the underlying I/O error
        kind: io::ErrorKind,
        /// Rendered I/O error
        message: String,
    },

    /// A stage refused to continue
    #[error("stage aborted: {0}")]
    Aborted(String),
}

impl StageError {
    /// Build a [`StageError::Read`] from an I/O error
    pub fn read(offset: u64, err: &io::Error) -> Self {
        StageError::Read {
            offset,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// I/O kind for read failures
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            StageError::Read { kind, .. } => Some(*kind),
            StageError::Aborted(_) => None,
        }
    }
}
