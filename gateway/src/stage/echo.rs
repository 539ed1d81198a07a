//! Echo stage: copies every record to a writer
//!
//! Used for debugging a chain. Write failures are logged and the record still
//! passes through.

use edgeproxy_core::{Event, EventStage, StageError};
use std::io::Write;
use tracing::warn;

/// Pass-through stage writing `prefix + message + suffix` per record
pub struct EchoStage<S> {
    upstream: S,
    writer: Box<dyn Write + Send>,
    prefix: String,
    suffix: String,
    write_errors: u64,
}

impl<S: EventStage> EchoStage<S> {
    /// Echo `upstream` into `writer`
    pub fn new(upstream: S, writer: Box<dyn Write + Send>) -> Self {
        Self {
            upstream,
            writer,
            prefix: String::new(),
            suffix: String::new(),
            write_errors: 0,
        }
    }

    /// Text written before each message
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Text written after each message
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Failed writes so far
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    fn echo(&mut self) -> std::io::Result<()> {
        let Some(event) = self.upstream.current() else {
            return Ok(());
        };
        self.writer.write_all(self.prefix.as_bytes())?;
        self.writer.write_all(&event.message)?;
        self.writer.write_all(self.suffix.as_bytes())?;
        self.writer.flush()
    }
}

impl<S: EventStage> EventStage for EchoStage<S> {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn advance(&mut self) -> bool {
        if !self.upstream.advance() {
            return false;
        }
        if let Err(e) = self.echo() {
            self.write_errors += 1;
            warn!(error = %e, "echo write failed");
        }
        true
    }

    fn current(&self) -> Option<&Event> {
        self.upstream.current()
    }

    fn error(&self) -> Option<&StageError> {
        self.upstream.error()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use edgeproxy_core::collect;
    use parking_lot::Mutex;
    use std::io::{self, Cursor};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn decoder(raw: &str) -> Decoder<Cursor<String>> {
        Decoder::new(Cursor::new(raw.to_string()), "test")
    }

    #[test]
    fn test_echoes_messages() {
        let out = SharedBuf::default();
        let mut stage = EchoStage::new(
            decoder("This is the test\nSecond line here\n"),
            Box::new(out.clone()),
        );

        let (events, err) = collect(&mut stage);
        assert_eq!(events.len(), 2);
        assert!(err.is_none());
        assert_eq!(&out.0.lock()[..], b"This is the testSecond line here");
    }

    #[test]
    fn test_prefix_and_suffix() {
        let out = SharedBuf::default();
        let mut stage = EchoStage::new(decoder("a\nb"), Box::new(out.clone()))
            .with_prefix("> ")
            .with_suffix("\n");

        collect(&mut stage);
        assert_eq!(&out.0.lock()[..], b"> a\n> b\n");
    }

    #[test]
    fn test_write_errors_are_not_fatal() {
        let mut stage = EchoStage::new(decoder("a\nb"), Box::new(Broken));

        let (events, err) = collect(&mut stage);
        assert_eq!(events.len(), 2);
        assert!(err.is_none());
        assert_eq!(stage.write_errors(), 2);
    }
}
