//! Event selector: fan-out of matching records onto extra topics
//!
//! A rule `{target_topic, selectors: {path: value}}` matches a JSON record
//! when every dot path resolves to a string equal to the expected value.
//! Each match appends a copy of the record, re-addressed to `target_topic`
//! and carrying `"__orig_topic__": <source topic>`. The original record is
//! always passed through unchanged.
//!
//! ```text
//! upstream:  A        B
//! output:    A  A'  A''   B  B'
//!               └pending┘    └pending
//! ```

use super::{BoxedStage, StageFactory};
use crate::error::{ProxyError, Result};
use edgeproxy_core::{Event, EventStage, StageError};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Field injected into selected copies
pub const ORIG_TOPIC_FIELD: &str = "__orig_topic__";

/// One fan-out rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectorConfig {
    /// Destination of the copies
    pub target_topic: String,
    /// Dot path to expected string value; all must match
    #[serde(default, alias = "matching")]
    pub selectors: BTreeMap<String, String>,
}

impl SelectorConfig {
    /// Convenience constructor
    pub fn new<'a>(
        target_topic: impl Into<String>,
        selectors: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            target_topic: target_topic.into(),
            selectors: selectors
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// True when every selector path holds the expected string
    pub fn matches(&self, message: &Value) -> bool {
        self.selectors.iter().all(|(path, expected)| {
            super::lookup_path(message, path).and_then(Value::as_str) == Some(expected.as_str())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SelectorsDocument {
    event_selectors: Vec<SelectorConfig>,
}

/// Shared, hot-reloadable rule set
///
/// Readers take an `Arc` snapshot; writers publish a fresh list.
#[derive(Debug, Default)]
pub struct EventSelector {
    rules: RwLock<Arc<Vec<SelectorConfig>>>,
}

impl EventSelector {
    /// Create with an initial rule list
    pub fn new(rules: Vec<SelectorConfig>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Current rules
    pub fn snapshot(&self) -> Arc<Vec<SelectorConfig>> {
        Arc::clone(&self.rules.read())
    }

    /// Replace the rules atomically
    pub fn apply_selectors(&self, rules: Vec<SelectorConfig>) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Parse `{event_selectors: [...]}` and apply it
    ///
    /// On a parse error the previous rules stay in place.
    pub fn update_config(&self, raw: &str) -> Result<usize> {
        let document: SelectorsDocument = serde_yaml::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("event selectors: {e}")))?;
        let count = document.event_selectors.len();
        self.apply_selectors(document.event_selectors);
        info!(rules = count, "event selectors updated");
        Ok(count)
    }

    /// Wrap `upstream` with the current rules
    pub fn stage<S: EventStage>(&self, upstream: S) -> SelectorStage<S> {
        SelectorStage::new(upstream, self.snapshot())
    }
}

impl StageFactory for EventSelector {
    fn name(&self) -> &'static str {
        "selector"
    }

    fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
        Box::new(self.stage(upstream))
    }
}

/// Fan-out stage over one request
///
/// Copies queued by one upstream record are all delivered before the next
/// upstream record is pulled, and before end-of-stream is reported.
pub struct SelectorStage<S> {
    upstream: S,
    rules: Arc<Vec<SelectorConfig>>,
    pending: VecDeque<Event>,
    /// Set while a queued copy is current; `None` means upstream's record
    selected: Option<Event>,
    copies: u64,
}

impl<S: EventStage> SelectorStage<S> {
    /// Wrap `upstream` with a fixed rule snapshot
    pub fn new(upstream: S, rules: Arc<Vec<SelectorConfig>>) -> Self {
        Self {
            upstream,
            rules,
            pending: VecDeque::new(),
            selected: None,
            copies: 0,
        }
    }

    /// Copies produced so far
    pub fn copies(&self) -> u64 {
        self.copies
    }

    fn select(&mut self) {
        if self.rules.is_empty() {
            return;
        }
        let Some(event) = self.upstream.current() else {
            return;
        };

        let message = match serde_json::from_slice::<Value>(&event.message) {
            Ok(message @ Value::Object(_)) => message,
            Ok(_) => return,
            Err(e) => {
                debug!(topic = %event.topic, offset = event.offset, error = %e, "selector skipped non-JSON record");
                return;
            }
        };

        let targets: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| rule.target_topic != event.topic && rule.matches(&message))
            .map(|rule| rule.target_topic.as_str())
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut message = message;
        if let Value::Object(map) = &mut message {
            map.insert(ORIG_TOPIC_FIELD.to_string(), Value::String(event.topic.clone()));
        }
        let copy = match serde_json::to_vec(&message) {
            Ok(rendered) => bytes::Bytes::from(rendered),
            Err(e) => {
                debug!(topic = %event.topic, error = %e, "selector could not render copy");
                return;
            }
        };

        for target in targets {
            self.pending.push_back(event.derive(target, copy.clone()));
        }
    }
}

impl<S: EventStage> EventStage for SelectorStage<S> {
    fn name(&self) -> &'static str {
        "selector"
    }

    fn advance(&mut self) -> bool {
        if let Some(copy) = self.pending.pop_front() {
            self.selected = Some(copy);
            self.copies += 1;
            return true;
        }

        self.selected = None;
        if !self.upstream.advance() {
            return false;
        }
        self.select();
        true
    }

    fn current(&self) -> Option<&Event> {
        match &self.selected {
            Some(copy) => Some(copy),
            None => self.upstream.current(),
        }
    }

    fn error(&self) -> Option<&StageError> {
        self.upstream.error()
    }
}
