//! Streaming record decoder
//!
//! Turns a byte stream into a lazy, offset-tracked sequence of [`Event`]s.
//!
//! Two framing modes:
//! - **Line** (default): a record is everything up to the next `\n`; a
//!   trailing `\r` is stripped too. The last record needs no terminator.
//! - **JSON brace**: back-to-back JSON objects are split by counting `{`
//!   and `}`, so `{"a":1}{"b":2}` is two records even without a separator.
//!
//! # Offsets
//!
//! Every record carries the offset of its first byte in the source stream.
//! Offsets advance by the raw bytes consumed for a record, terminators
//! included, so `offset[i] + consumed[i] == offset[i + 1]` always holds.
//!
//! # End of stream
//!
//! After producing a record the decoder peeks one byte ahead. When nothing
//! is left the stream ends on the *next* `advance()`. A read error is held
//! back while already-buffered bytes can still produce records; it becomes
//! visible through `error()` on the call that returns the last buffered
//! record.

use bytes::Bytes;
use edgeproxy_core::{Event, EventStage, EventType, StageError};
use std::io::{BufRead, BufReader, ErrorKind, Read};

/// Framing options for a [`Decoder`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Split back-to-back JSON objects by brace balance
    pub json_framing: bool,
    /// Strip leading and trailing ASCII whitespace from each record
    pub trim: bool,
}

impl DecoderOptions {
    /// Builder: enable JSON brace framing
    pub fn json_framing(mut self, enabled: bool) -> Self {
        self.json_framing = enabled;
        self
    }

    /// Builder: enable record trimming
    pub fn trim(mut self, enabled: bool) -> Self {
        self.trim = enabled;
        self
    }
}

/// Byte stream decoder, the source stage of every pipeline
///
/// # Example
///
/// ```
/// use edgeproxy_core::EventStage;
/// use edgeproxy_gateway::decode::Decoder;
///
/// let mut decoder = Decoder::new("a\nb\r\nc".as_bytes(), "clicks");
/// let mut offsets = Vec::new();
/// while decoder.advance() {
///     offsets.push(decoder.current().map(|e| e.offset));
/// }
/// assert_eq!(offsets, vec![Some(0), Some(2), Some(5)]);
/// assert!(decoder.error().is_none());
/// ```
pub struct Decoder<R> {
    reader: BufReader<R>,
    topic: String,
    kind: EventType,
    options: DecoderOptions,
    /// Bytes of the last read line not yet handed out as records
    leftover: Vec<u8>,
    next_offset: u64,
    current: Option<Event>,
    /// Read error waiting for `leftover` to drain
    pending_error: Option<StageError>,
    error: Option<StageError>,
    finished: bool,
    bytes_read: u64,
    records_read: u64,
}

impl<R: Read> Decoder<R> {
    /// Create a line-mode decoder tagging every record with `topic`
    pub fn new(source: R, topic: impl Into<String>) -> Self {
        Self::with_options(source, topic, DecoderOptions::default())
    }

    /// Create a decoder with explicit framing options
    pub fn with_options(source: R, topic: impl Into<String>, options: DecoderOptions) -> Self {
        Self {
            reader: BufReader::new(source),
            topic: topic.into(),
            kind: EventType::Unknown,
            options,
            leftover: Vec::new(),
            next_offset: 0,
            current: None,
            pending_error: None,
            error: None,
            finished: false,
            bytes_read: 0,
            records_read: 0,
        }
    }

    /// Builder: classification stamped on every record
    pub fn with_kind(mut self, kind: EventType) -> Self {
        self.kind = kind;
        self
    }

    /// Raw bytes consumed so far, terminators included
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Non-empty records produced so far
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Topic stamped on every record
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn fill_leftover(&mut self) {
        let mut line = Vec::new();
        loop {
            match self.reader.read_until(b'\n', &mut line) {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let at = self.next_offset + line.len() as u64;
                    tracing::debug!(topic = %self.topic, offset = at, error = %e, "decoder read failed");
                    self.pending_error = Some(StageError::read(at, &e));
                    break;
                }
            }
        }
        self.leftover = line;
    }

    /// Take the next JSON-brace framed record out of `leftover`
    fn take_json_record(&mut self) -> Vec<u8> {
        match json_boundary(&self.leftover) {
            Some(end) => {
                let rest = self.leftover.split_off(end);
                std::mem::replace(&mut self.leftover, rest)
            }
            None => std::mem::take(&mut self.leftover),
        }
    }

    /// True when the source has nothing more to give
    fn source_exhausted(&mut self) -> bool {
        if self.pending_error.is_some() {
            return true;
        }
        loop {
            match self.reader.fill_buf() {
                Ok(buf) => return buf.is_empty(),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending_error = Some(StageError::read(self.next_offset, &e));
                    return true;
                }
            }
        }
    }
}

impl<R: Read + Send> EventStage for Decoder<R> {
    fn name(&self) -> &'static str {
        "decoder"
    }

    fn advance(&mut self) -> bool {
        if self.finished {
            return false;
        }

        let offset = self.next_offset;
        if self.leftover.is_empty() {
            self.fill_leftover();
        }

        let raw = if self.options.json_framing {
            self.take_json_record()
        } else {
            std::mem::take(&mut self.leftover)
        };
        let consumed = raw.len() as u64;
        self.bytes_read += consumed;
        self.next_offset += consumed;

        let mut end = raw.len();
        if end > 0 && raw[end - 1] == b'\n' {
            end -= 1;
        }
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        if end > 0 {
            self.records_read += 1;
        }

        let mut start = 0;
        if self.options.trim {
            let body = &raw[..end];
            start = body
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(end);
            end = body
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(start, |p| p + 1);
        }
        let message = Bytes::from(raw).slice(start..end);

        self.current = Some(Event {
            topic: self.topic.clone(),
            message,
            offset,
            kind: self.kind,
        });

        if self.leftover.is_empty() && self.source_exhausted() {
            self.finished = true;
            self.error = self.pending_error.take();
        }
        true
    }

    fn current(&self) -> Option<&Event> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&StageError> {
        self.error.as_ref()
    }
}

/// End of the first complete object in `buf`, when more records follow it
///
/// A record ends where the brace counts balance and the next byte is not
/// framing whitespace. `None` means the whole buffer is one record: no
/// balanced object was found, or only whitespace follows it.
fn json_boundary(buf: &[u8]) -> Option<usize> {
    let mut open = 0usize;
    let mut closed = 0usize;

    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'{' => open += 1,
            b'}' if open > 0 => closed += 1,
            _ => {}
        }
        if open == 0 || open != closed {
            continue;
        }
        if buf.get(i + 1).is_some_and(|&next| is_framing_whitespace(next)) {
            continue;
        }
        if buf[i + 1..].iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        return Some(i + 1);
    }
    None
}

/// Separator bytes tolerated between a balanced object and the next one
fn is_framing_whitespace(b: u8) -> bool {
    matches!(b, b'\n' | b'\t' | b' ')
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use edgeproxy_core::collect;
    use std::io;

    /// Reader that yields its source until `error_at`, then fails
    struct ErrorAtOffsetReader<R> {
        inner: R,
        offset: usize,
        error_at: usize,
        kind: io::ErrorKind,
    }

    impl<R: Read> ErrorAtOffsetReader<R> {
        fn new(inner: R, error_at: usize, kind: io::ErrorKind) -> Self {
            Self {
                inner,
                offset: 0,
                error_at,
                kind,
            }
        }
    }

    impl<R: Read> Read for ErrorAtOffsetReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.offset >= self.error_at {
                return Err(io::Error::new(self.kind, "injected failure"));
            }
            let limit = buf.len().min(self.error_at - self.offset);
            let n = self.inner.read(&mut buf[..limit])?;
            self.offset += n;
            Ok(n)
        }
    }

    fn decode_lines(raw: &str) -> (Vec<Event>, Option<StageError>) {
        let mut decoder = Decoder::new(raw.as_bytes(), "test");
        collect(&mut decoder)
    }

    fn decode_json(raw: &str, trim: bool) -> Vec<Event> {
        let options = DecoderOptions::default().json_framing(true).trim(trim);
        let mut decoder = Decoder::with_options(raw.as_bytes(), "test", options);
        let (events, err) = collect(&mut decoder);
        assert!(err.is_none());
        events
    }

    /// Expected records for line mode: split on '\n' after dropping one final terminator
    fn expected_lines(raw: &str) -> Vec<(u64, String)> {
        let body = raw.strip_suffix('\n').unwrap_or(raw);
        let body = body.strip_suffix('\r').unwrap_or(body);
        let mut offset = 0u64;
        body.split('\n')
            .map(|line| {
                let at = offset;
                offset += line.len() as u64 + 1;
                (at, line.trim_end_matches('\r').to_string())
            })
            .collect()
    }

    // ==========================================================================
    // Line Mode
    // ==========================================================================

    #[test]
    fn test_line_round_trip_with_crlf() {
        let (events, err) = decode_lines("a\nb\r\nc");

        let messages: Vec<&str> = events.iter().map(|e| e.message_str().unwrap()).collect();
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert_eq!(offsets, vec![0, 2, 5]);
        assert!(err.is_none());
    }

    #[test]
    fn test_line_corpus_offsets_and_lengths() {
        let long: String = "abc, \tXYZ".repeat(2500);
        let corpus = vec![
            "first line\n\n\n".to_string(),
            "1234567890\r\n1234567\n123\n".to_string(),
            "this is a test\r\n that goes many lines\nand has no newline in the end".to_string(),
            "this is a unicode symbol: Ƴ\nand here's one more Ë to test\n".to_string(),
            "1234567890\n".to_string(),
            "1234567890\r\n".to_string(),
            "1234567890".to_string(),
            String::new(),
            "\n".to_string(),
            "first line\n\ntrailing line\n".to_string(),
            "first line\n\n\n\n\r\n\ntrailing line\n".to_string(),
            format!("{long}\n{long}{long}\nbottom\n"),
        ];

        for raw in corpus {
            let (events, err) = decode_lines(&raw);
            let expected = expected_lines(&raw);
            assert!(err.is_none(), "unexpected error for {raw:?}");
            assert_eq!(events.len(), expected.len(), "record count for {raw:?}");
            for (event, (offset, line)) in events.iter().zip(&expected) {
                assert_eq!(event.offset, *offset, "offset in {raw:?}");
                assert_eq!(event.message_str().unwrap(), line, "record in {raw:?}");
            }
        }
    }

    #[test]
    fn test_offsets_are_monotonic_and_contiguous() {
        let raw = "x\r\n\nyy\n{\"a\":1}\nlast";
        let mut decoder = Decoder::new(raw.as_bytes(), "test");
        let mut previous: Option<u64> = None;
        while decoder.advance() {
            let offset = decoder.current().unwrap().offset;
            if let Some(p) = previous {
                assert!(offset >= p);
            }
            previous = Some(offset);
        }
        assert_eq!(decoder.bytes_read(), raw.len() as u64);
    }

    #[test]
    fn test_empty_input_yields_one_empty_record() {
        let (events, err) = decode_lines("");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_empty());
        assert_eq!(events[0].offset, 0);
        assert!(err.is_none());
    }

    #[test]
    fn test_end_of_stream_reported_on_next_call() {
        let mut decoder = Decoder::new("only\n".as_bytes(), "test");
        assert!(decoder.advance());
        assert_eq!(decoder.current().unwrap().message_str(), Some("only"));
        assert!(!decoder.advance());
        assert!(!decoder.advance());
        assert!(decoder.error().is_none());
    }

    #[test]
    fn test_counters_and_topic() {
        let mut decoder = Decoder::new("a\n\nbc\n".as_bytes(), "clicks").with_kind(EventType::Raw);
        let (events, _) = collect(&mut decoder);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.topic == "clicks" && e.kind == EventType::Raw));
        assert_eq!(decoder.bytes_read(), 6);
        assert_eq!(decoder.records_read(), 2);
        assert_eq!(decoder.topic(), "clicks");
    }

    #[test]
    fn test_trim_in_line_mode() {
        let options = DecoderOptions::default().trim(true);
        let mut decoder = Decoder::with_options("  a \t\n b\n".as_bytes(), "test", options);
        let (events, _) = collect(&mut decoder);
        let messages: Vec<&str> = events.iter().map(|e| e.message_str().unwrap()).collect();
        assert_eq!(messages, vec!["a", "b"]);
        assert_eq!(events[1].offset, 6);
    }

    // ==========================================================================
    // JSON Brace Mode
    // ==========================================================================

    #[test]
    fn test_json_two_objects_without_separator() {
        let events = decode_json(r#"{"a":1}{"b":2}"#, false);
        let lengths: Vec<usize> = events.iter().map(|e| e.len()).collect();
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        assert_eq!(lengths, vec![7, 7]);
        assert_eq!(offsets, vec![0, 7]);
    }

    #[test]
    fn test_json_objects_of_different_sizes() {
        let events = decode_json(r#"{"event":"test"}{"event":"extra"}"#, false);
        let lengths: Vec<usize> = events.iter().map(|e| e.len()).collect();
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 16]);
        assert_eq!(lengths, vec![16, 17]);
    }

    #[test]
    fn test_json_interior_whitespace_is_absorbed() {
        let raw = "\"{event\":\"test\"} \t{\"event\":\"1234\"} s\n";

        let events = decode_json(raw, false);
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        let lengths: Vec<usize> = events.iter().map(|e| e.len()).collect();
        assert_eq!(offsets, vec![0, 18, 35]);
        assert_eq!(lengths, vec![18, 17, 1]);

        let trimmed = decode_json(raw, true);
        let offsets: Vec<u64> = trimmed.iter().map(|e| e.offset).collect();
        let lengths: Vec<usize> = trimmed.iter().map(|e| e.len()).collect();
        assert_eq!(offsets, vec![0, 18, 35]);
        assert_eq!(lengths, vec![16, 16, 1]);
    }

    #[test]
    fn test_json_nested_braces_stay_together() {
        let events = decode_json(r#"{"a":{"b":{}}}{"c":1}"#, false);
        let messages: Vec<&str> = events.iter().map(|e| e.message_str().unwrap()).collect();
        assert_eq!(messages, vec![r#"{"a":{"b":{}}}"#, r#"{"c":1}"#]);
    }

    #[test]
    fn test_json_trailing_whitespace_belongs_to_last_record() {
        let events = decode_json("{\"a\":1}{\"b\":2}  \n", false);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message_str(), Some("{\"b\":2}  "));
    }

    #[test]
    fn test_json_mode_across_lines() {
        let events = decode_json("{\"a\":1}\n{\"b\":2}\n", false);
        let messages: Vec<&str> = events.iter().map(|e| e.message_str().unwrap()).collect();
        assert_eq!(messages, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(events[1].offset, 8);
    }

    #[test]
    fn test_json_without_braces_is_whole_line() {
        let events = decode_json("plain text\nmore", false);
        let messages: Vec<&str> = events.iter().map(|e| e.message_str().unwrap()).collect();
        assert_eq!(messages, vec!["plain text", "more"]);
    }

    // ==========================================================================
    // Read Errors
    // ==========================================================================

    #[test]
    fn test_read_error_terminates_stream() {
        let raw = "first line\nsecond line\n";
        let reader = ErrorAtOffsetReader::new(raw.as_bytes(), 2, io::ErrorKind::UnexpectedEof);
        let mut decoder = Decoder::new(reader, "test");

        assert!(decoder.advance());
        let event = decoder.current().unwrap();
        assert_eq!(event.message_str(), Some("fi"));
        assert_eq!(event.offset, 0);
        // visible on the call that returns the last record
        let err = decoder.error().cloned().unwrap();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, StageError::Read { offset: 2, .. }));

        assert!(!decoder.advance());
        assert_eq!(decoder.error(), Some(&err));
    }

    #[test]
    fn test_read_error_after_complete_line() {
        let raw = "ab\ncd\n";
        let reader = ErrorAtOffsetReader::new(raw.as_bytes(), 3, io::ErrorKind::ConnectionReset);
        let mut decoder = Decoder::new(reader, "test");

        assert!(decoder.advance());
        assert_eq!(decoder.current().unwrap().message_str(), Some("ab"));
        // the failed peek ends the stream right here
        let err = decoder.error().cloned().unwrap();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));
        assert!(!decoder.advance());
    }

    #[test]
    fn test_read_error_held_back_while_buffer_drains() {
        // three objects in one partial read, then the connection breaks
        let raw = "{\"a\":1}{\"b\":2}{\"c\":3}rest-never-read";
        let reader = ErrorAtOffsetReader::new(raw.as_bytes(), 21, io::ErrorKind::ConnectionReset);
        let options = DecoderOptions::default().json_framing(true);
        let mut decoder = Decoder::with_options(reader, "test", options);

        assert!(decoder.advance());
        assert_eq!(decoder.current().unwrap().message_str(), Some("{\"a\":1}"));
        assert!(decoder.error().is_none());

        assert!(decoder.advance());
        assert_eq!(decoder.current().unwrap().message_str(), Some("{\"b\":2}"));
        assert!(decoder.error().is_none());

        assert!(decoder.advance());
        assert_eq!(decoder.current().unwrap().message_str(), Some("{\"c\":3}"));
        assert_eq!(decoder.current().unwrap().offset, 14);
        let err = decoder.error().cloned().unwrap();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));

        assert!(!decoder.advance());
        assert_eq!(decoder.error(), Some(&err));
    }

    #[test]
    fn test_interrupted_reader_over_corpus() {
        for raw in ["first line\n\n\n", "1234567890\r\n1234567\n123\n", "\n", ""] {
            let reader = ErrorAtOffsetReader::new(raw.as_bytes(), 2, io::ErrorKind::UnexpectedEof);
            let mut decoder = Decoder::new(reader, "test");
            let (events, err) = collect(&mut decoder);
            let last_offset = events.last().map(|e| e.offset).unwrap_or(0);
            // a record past the failure point implies the failure was reported
            assert!(!(last_offset > 2 && err.is_none()), "{raw:?}");
            if raw.len() > 2 {
                assert!(err.is_some(), "{raw:?}");
            }
        }
    }
}
