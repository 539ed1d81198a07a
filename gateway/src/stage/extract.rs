//! Counters derived from record fields
//!
//! Each exporter owns one `CounterVec` whose labels are its aggregation
//! names. A record on one of the exporter's topics increments the series
//! selected by the aggregation values found in the record:
//!
//! ```yaml
//! exporters:
//!   - metric: { name: edge_events_total, help: Events by type }
//!     topics: [events]
//!     aggregations:
//!       - { name: event, paths: [event, payload.event] }
//!       - { name: country, paths: [from_country], modify: tolower }
//! ```

use super::{lookup_path, BoxedStage, StageFactory};
use crate::error::{ProxyError, Result};
use edgeproxy_core::{Event, EventStage, StageError};
use prometheus::{IntCounterVec, Opts, Registry};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Path that falls back to the record's topic
const TOPIC_PATH: &str = "topic";

/// Name and help of an exported counter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricConfig {
    /// Metric name
    pub name: String,
    /// Help text
    #[serde(default)]
    pub help: String,
}

/// Case change applied to an extracted value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modify {
    /// Lowercase
    ToLower,
    /// Uppercase
    ToUpper,
}

impl Modify {
    fn apply(self, value: String) -> String {
        match self {
            Modify::ToLower => value.to_lowercase(),
            Modify::ToUpper => value.to_uppercase(),
        }
    }
}

/// One label of an exported counter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggregationConfig {
    /// Label name
    pub name: String,
    /// Dot paths tried in order; the first non-empty value wins
    #[serde(default)]
    pub paths: Vec<String>,
    /// Accepted values; a record with any other value is not counted
    #[serde(default)]
    pub values: Vec<String>,
    /// Case change
    #[serde(default)]
    pub modify: Option<Modify>,
}

/// One exported counter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExporterConfig {
    /// Counter name and help
    pub metric: MetricConfig,
    /// Topics counted by this exporter
    #[serde(default)]
    pub topics: Vec<String>,
    /// Labels
    #[serde(default)]
    pub aggregations: Vec<AggregationConfig>,
}

struct Exporter {
    config: ExporterConfig,
    topics: HashSet<String>,
    counter: IntCounterVec,
}

impl Exporter {
    /// Label values for `message`, or `None` when the record is skipped
    fn labels(&self, topic: &str, message: &Value) -> Option<Vec<String>> {
        self.config
            .aggregations
            .iter()
            .map(|aggregation| {
                let found = aggregation
                    .paths
                    .iter()
                    .find_map(|path| resolve(message, path, topic))
                    .unwrap_or_default();

                if !aggregation.values.is_empty() && !aggregation.values.contains(&found) {
                    return None;
                }
                Some(match aggregation.modify {
                    Some(modify) => modify.apply(found),
                    None => found,
                })
            })
            .collect()
    }
}

/// Non-empty string form of the value at `path`
fn resolve(message: &Value, path: &str, topic: &str) -> Option<String> {
    let value = match lookup_path(message, path) {
        Some(value) => value,
        None if path == TOPIC_PATH => return Some(topic.to_string()),
        None => return None,
    };
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Shared set of exporters
///
/// Clones share the registered counters.
#[derive(Clone)]
pub struct MetricsExtractor {
    exporters: Arc<Vec<Exporter>>,
}

impl MetricsExtractor {
    /// Create every exporter's counter and register it into `registry`
    pub fn new(exporters: Vec<ExporterConfig>, registry: &Registry) -> Result<Self> {
        let mut built = Vec::with_capacity(exporters.len());
        for config in exporters {
            let labels: Vec<&str> = config.aggregations.iter().map(|a| a.name.as_str()).collect();
            let counter = IntCounterVec::new(
                Opts::new(config.metric.name.clone(), config.metric.help.clone()),
                &labels,
            )
            .map_err(|e| ProxyError::Metrics(format!("{}: {e}", config.metric.name)))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| ProxyError::Metrics(format!("{}: {e}", config.metric.name)))?;

            built.push(Exporter {
                topics: config.topics.iter().cloned().collect(),
                config,
                counter,
            });
        }

        Ok(Self {
            exporters: Arc::new(built),
        })
    }

    /// Number of exporters
    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    /// True when nothing is exported
    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    /// Count one record
    pub fn observe(&self, event: &Event) {
        let mut parsed: Option<Option<Value>> = None;

        for exporter in self.exporters.iter() {
            if !exporter.topics.contains(&event.topic) {
                continue;
            }
            let message = parsed.get_or_insert_with(|| serde_json::from_slice(&event.message).ok());
            let Some(message) = message else {
                debug!(topic = %event.topic, offset = event.offset, "metric extraction skipped non-JSON record");
                return;
            };
            if let Some(values) = exporter.labels(&event.topic, message) {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                exporter.counter.with_label_values(&values).inc();
            }
        }
    }

    /// Wrap `upstream`
    pub fn stage<S: EventStage>(&self, upstream: S) -> ExtractStage<S> {
        ExtractStage {
            upstream,
            extractor: self.clone(),
        }
    }
}

impl StageFactory for MetricsExtractor {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
        Box::new(self.stage(upstream))
    }
}

/// Pass-through stage counting each record
pub struct ExtractStage<S> {
    upstream: S,
    extractor: MetricsExtractor,
}

impl<S: EventStage> EventStage for ExtractStage<S> {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn advance(&mut self) -> bool {
        if !self.upstream.advance() {
            return false;
        }
        if let Some(event) = self.upstream.current() {
            self.extractor.observe(event);
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
