//! Per-event-type schema validation
//!
//! The discriminator (the string at `property_name`, `event` by default)
//! picks a schema. Records on validated topics that fail it are rerouted to
//! the invalid messages topic as `topic\tmessage`.

use super::{BoxedStage, StageFactory};
use crate::error::{ProxyError, Result};
use crate::transport::filter::reroute;
use edgeproxy_core::{Event, EventStage, StageError};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

fn default_property_name() -> String {
    "event".to_string()
}

/// JSON type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// JSON string
    String,
    /// Any JSON number
    Number,
    /// Number without a fractional part
    Integer,
    /// `true` or `false`
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
    /// `null`
    Null,
}

impl FieldType {
    /// True when `value` has this type
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Null => value.is_null(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Null => "null",
        }
    }
}

/// Schema of one event type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchemaRule {
    /// Fields that must be present
    pub required: Vec<String>,
    /// Expected type of each field, when present
    pub properties: BTreeMap<String, FieldType>,
}

/// Schema validation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Reroute destination; the proxy's invalid messages topic when unset
    pub invalid_messages_topic: Option<String>,
    /// Topics whose records are validated
    pub validate_topics: Vec<String>,
    /// Discriminator field
    #[serde(default = "default_property_name")]
    pub property_name: String,
    /// Discriminator value to schema
    pub schemas: BTreeMap<String, SchemaRule>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            invalid_messages_topic: None,
            validate_topics: Vec::new(),
            property_name: default_property_name(),
            schemas: BTreeMap::new(),
        }
    }
}

/// Why a record failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Not a JSON object
    NotAnObject,
    /// Discriminator missing or not a string
    MissingDiscriminator,
    /// No schema for the discriminator value
    UnknownType(String),
    /// Required field absent
    MissingField(String),
    /// Field present with the wrong type
    WrongType {
        /// Offending field
        field: String,
        /// Declared type
        expected: FieldType,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotAnObject => write!(f, "not a JSON object"),
            Violation::MissingDiscriminator => write!(f, "missing discriminator"),
            Violation::UnknownType(t) => write!(f, "no schema for '{t}'"),
            Violation::MissingField(field) => write!(f, "missing required field '{field}'"),
            Violation::WrongType { field, expected } => {
                write!(f, "field '{field}' is not {}", expected.as_str())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchemasDocument {
    schemas: BTreeMap<String, SchemaRule>,
}

/// Shared schema set with atomic replacement
///
/// Clones share the schemas and the rerouted counter.
#[derive(Clone)]
pub struct SchemaRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    schemas: RwLock<Arc<BTreeMap<String, SchemaRule>>>,
    validate_topics: HashSet<String>,
    property_name: String,
    invalid_topic: String,
    rerouted: AtomicU64,
}

impl SchemaRegistry {
    /// Build from configuration; `invalid_topic` is the fallback destination
    pub fn from_config(config: &SchemaConfig, invalid_topic: &str) -> Result<Self> {
        let invalid_topic = config
            .invalid_messages_topic
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(invalid_topic);
        if invalid_topic.is_empty() {
            return Err(ProxyError::Config(
                "schema: invalid messages topic must not be empty".into(),
            ));
        }
        if config.property_name.is_empty() {
            return Err(ProxyError::Config(
                "schema: property_name must not be empty".into(),
            ));
        }

        info!(
            topics = ?config.validate_topics,
            schemas = config.schemas.len(),
            "schema validation configured"
        );
        Ok(Self {
            inner: Arc::new(RegistryInner {
                schemas: RwLock::new(Arc::new(config.schemas.clone())),
                validate_topics: config.validate_topics.iter().cloned().collect(),
                property_name: config.property_name.clone(),
                invalid_topic: invalid_topic.to_string(),
                rerouted: AtomicU64::new(0),
            }),
        })
    }

    /// Replace all schemas
    pub fn apply(&self, schemas: BTreeMap<String, SchemaRule>) {
        *self.inner.schemas.write() = Arc::new(schemas);
    }

    /// Parse `{schemas: {...}}` and apply it; errors keep the current set
    pub fn apply_yaml(&self, raw: &str) -> Result<usize> {
        let document: SchemasDocument = serde_yaml::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("schemas: {e}")))?;
        let count = document.schemas.len();
        self.apply(document.schemas);
        info!(schemas = count, "schemas updated");
        Ok(count)
    }

    /// Current schemas
    pub fn snapshot(&self) -> Arc<BTreeMap<String, SchemaRule>> {
        Arc::clone(&self.inner.schemas.read())
    }

    /// Reroute destination
    pub fn invalid_topic(&self) -> &str {
        &self.inner.invalid_topic
    }

    /// True when records on `topic` are checked
    pub fn validates(&self, topic: &str) -> bool {
        self.inner.validate_topics.contains(topic)
    }

    /// Records rerouted so far
    pub fn rerouted(&self) -> u64 {
        self.inner.rerouted.load(Ordering::Relaxed)
    }

    /// Check one message against `schemas`
    pub fn validate(
        &self,
        schemas: &BTreeMap<String, SchemaRule>,
        message: &[u8],
    ) -> std::result::Result<(), Violation> {
        let object: Map<String, Value> =
            serde_json::from_slice(message).map_err(|_| Violation::NotAnObject)?;

        let kind = object
            .get(&self.inner.property_name)
            .and_then(Value::as_str)
            .ok_or(Violation::MissingDiscriminator)?;
        let rule = schemas
            .get(kind)
            .ok_or_else(|| Violation::UnknownType(kind.to_string()))?;

        if let Some(missing) = rule.required.iter().find(|f| !object.contains_key(f.as_str())) {
            return Err(Violation::MissingField(missing.clone()));
        }
        for (field, expected) in &rule.properties {
            if let Some(value) = object.get(field) {
                if !expected.accepts(value) {
                    return Err(Violation::WrongType {
                        field: field.clone(),
                        expected: *expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// Wrap `upstream`; the schema set is fixed for the stage's lifetime
    pub fn stage<S: EventStage>(&self, upstream: S) -> SchemaStage<S> {
        SchemaStage {
            upstream,
            registry: self.clone(),
            schemas: self.snapshot(),
            current: None,
        }
    }
}

impl StageFactory for SchemaRegistry {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
        Box::new(self.stage(upstream))
    }
}

/// Stage validating each record of one request
pub struct SchemaStage<S> {
    upstream: S,
    registry: SchemaRegistry,
    schemas: Arc<BTreeMap<String, SchemaRule>>,
    /// Rerouted record; `None` means upstream's record passed
    current: Option<Event>,
}

impl<S: EventStage> SchemaStage<S> {
    fn check(&self, event: &Event) -> Option<Event> {
        // nothing loaded: validation is skipped
        if self.schemas.is_empty() || !self.registry.validates(&event.topic) {
            return None;
        }
        match self.registry.validate(&self.schemas, &event.message) {
            Ok(()) => None,
            Err(violation) => {
                debug!(
                    topic = %event.topic,
                    offset = event.offset,
                    %violation,
                    "record failed schema validation"
                );
                self.registry.inner.rerouted.fetch_add(1, Ordering::Relaxed);
                Some(reroute(event, self.registry.invalid_topic()))
            }
        }
    }
}

impl<S: EventStage> EventStage for SchemaStage<S> {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        if !self.upstream.advance() {
            return false;
        }
        self.current = self.upstream.current().and_then(|e| self.check(e));
        true
    }

    fn current(&self) -> Option<&Event> {
        self.current.as_ref().or_else(|| self.upstream.current())
    }

    fn error(&self) -> Option<&StageError> {
        self.upstream.error()
    }
}
