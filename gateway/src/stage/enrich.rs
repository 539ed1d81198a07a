//! Extra JSON fields appended to every record
//!
//! Fields are merged textually before the record's last `}`, so the record is
//! never re-serialized:
//!
//! ```text
//! {"a":1}  +  {"b":2}  =>  {"a":1,"b":2}
//! ```

use super::{BoxedStage, StageFactory};
use bytes::{Bytes, BytesMut};
use edgeproxy_core::{Event, EventStage, StageError};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Value producer evaluated once per record
pub type FieldFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Extra field settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtraFieldsConfig {
    /// Constant fields
    pub fields: Map<String, Value>,
    /// Field name to sequence name; each record gets the next value
    pub sequences: BTreeMap<String, String>,
}

/// Named monotonically increasing counters
///
/// The first value handed out for a name is 1.
#[derive(Debug, Default)]
pub struct SequenceManager {
    sequences: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl SequenceManager {
    /// Create with no sequences
    pub fn new() -> Self {
        Self::default()
    }

    /// Next-value function for `name`, created on first use
    pub fn get_for_name(&self, name: &str) -> impl Fn() -> u64 + Send + Sync + 'static {
        let counter = self.counter(name);
        move || counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last value handed out for `name`, 0 when unused
    pub fn current(&self, name: &str) -> u64 {
        self.sequences
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.sequences.read().get(name) {
            return Arc::clone(counter);
        }
        let mut sequences = self.sequences.write();
        Arc::clone(sequences.entry(name.to_string()).or_default())
    }
}

/// Merge `extra` (a JSON object) into `line` before its last `}`
///
/// - empty `line` gives `extra`
/// - empty or `{}` `extra` gives `line`
/// - `line` without `}` is returned unchanged
pub fn append_json_extra_fields(line: &[u8], extra: &[u8]) -> Bytes {
    if line.is_empty() {
        return Bytes::copy_from_slice(extra);
    }
    if extra.is_empty() || extra == b"{}" {
        return Bytes::copy_from_slice(line);
    }
    let Some(close) = line.iter().rposition(|&b| b == b'}') else {
        return Bytes::copy_from_slice(line);
    };

    let head = &line[..close];
    let mut out = BytesMut::with_capacity(head.len() + extra.len());
    out.extend_from_slice(head);
    // `{}` + extra must not produce `{,`
    if head.trim_ascii_end().last() != Some(&b'{') {
        out.extend_from_slice(b",");
    }
    out.extend_from_slice(&extra[1..]);
    out.freeze()
}

/// Shared enricher: rendered static fields plus per-record field functions
#[derive(Clone, Default)]
pub struct Enricher {
    fields: Bytes,
    dynamic: Vec<(String, FieldFn)>,
}

impl Enricher {
    /// Enricher with constant `fields`
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields: render(fields),
            dynamic: Vec::new(),
        }
    }

    /// Build from configuration, drawing sequences from `sequences`
    pub fn from_config(config: &ExtraFieldsConfig, sequences: Arc<SequenceManager>) -> Self {
        let mut enricher = Self::new(config.fields.clone());
        for (field, sequence) in &config.sequences {
            let next = sequences.get_for_name(sequence);
            enricher = enricher.with_field_fn(field.clone(), move || Value::from(next()));
        }
        enricher
    }

    /// Add a field whose value is computed for every record
    pub fn with_field_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.dynamic.push((name.into(), Arc::new(f)));
        self
    }

    /// Rendered constant fields
    pub fn static_fields(&self) -> &[u8] {
        &self.fields
    }

    /// Message with every extra field appended
    pub fn enrich(&self, message: &[u8]) -> Bytes {
        let mut out = append_json_extra_fields(message, &self.fields);
        if !self.dynamic.is_empty() {
            let values: Map<String, Value> = self
                .dynamic
                .iter()
                .map(|(name, f)| (name.clone(), f()))
                .collect();
            out = append_json_extra_fields(&out, &render(values));
        }
        out
    }

    /// Wrap `upstream`
    pub fn stage<S: EventStage>(&self, upstream: S) -> EnrichStage<S> {
        EnrichStage {
            upstream,
            enricher: self.clone(),
            current: None,
        }
    }
}

impl StageFactory for Enricher {
    fn name(&self) -> &'static str {
        "enrich"
    }

    fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
        Box::new(self.stage(upstream))
    }
}

fn render(fields: Map<String, Value>) -> Bytes {
    if fields.is_empty() {
        return Bytes::new();
    }
    Bytes::from(Value::Object(fields).to_string())
}

/// Stage appending extra fields to each record of one request
pub struct EnrichStage<S> {
    upstream: S,
    enricher: Enricher,
    current: Option<Event>,
}

impl<S: EventStage> EventStage for EnrichStage<S> {
    fn name(&self) -> &'static str {
        "enrich"
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        if !self.upstream.advance() {
            return false;
        }
        self.current = self
            .upstream
            .current()
            .map(|e| e.derive(e.topic.clone(), self.enricher.enrich(&e.message)));
        true
    }

    fn current(&self) -> Option<&Event> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&StageError> {
        self.upstream.error()
    }
}
