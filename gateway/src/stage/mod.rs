//! Transform stages
//!
//! Every transform wraps an upstream [`EventStage`] and is itself one, so a
//! request's chain is built by nesting:
//!
//! ```text
//! Decoder ──► selector ──► anonymize ──► enrich ──► schema ──► extract ──► Transport
//! ```
//!
//! Long-lived state (rules, registries, counters) sits in a [`StageFactory`]
//! shared across requests; each request gets fresh stage instances from
//! [`StageChain::wrap`].

pub mod anonymize;
pub mod echo;
pub mod enrich;
pub mod extract;
pub mod schema;
pub mod selector;

pub use anonymize::{Anonymizer, AnonymizeConfig, AnonymizeStage, IpExemption};
pub use echo::EchoStage;
pub use enrich::{EnrichStage, Enricher, ExtraFieldsConfig, SequenceManager};
pub use extract::{ExporterConfig, ExtractStage, MetricsExtractor};
pub use schema::{SchemaConfig, SchemaRegistry, SchemaStage};
pub use selector::{EventSelector, SelectorConfig, SelectorStage};

use crate::config::StagesConfig;
use crate::error::Result;
use edgeproxy_core::EventStage;
use prometheus::Registry;
use serde_json::Value;
use std::sync::Arc;

/// Boxed stage, the unit a chain is built from
pub type BoxedStage = Box<dyn EventStage>;

/// Long-lived owner of a transform's state
///
/// # Example
///
/// ```ignore
/// struct Passthrough;
///
/// impl StageFactory for Passthrough {
///     fn name(&self) -> &'static str { "passthrough" }
///
///     fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
///         upstream
///     }
/// }
/// ```
pub trait StageFactory: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Wrap `upstream` in a fresh stage instance
    fn wrap(&self, upstream: BoxedStage) -> BoxedStage;
}

/// Ordered list of factories applied to every request
#[derive(Default, Clone)]
pub struct StageChain {
    factories: Vec<Arc<dyn StageFactory>>,
}

impl StageChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factory; it wraps the output of the ones added before
    pub fn add(&mut self, factory: Arc<dyn StageFactory>) {
        self.factories.push(factory);
    }

    /// Builder form of [`StageChain::add`]
    pub fn with(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.add(factory);
        self
    }

    /// Names in application order
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Number of factories
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when no transform is configured
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build one request's chain on top of `source`
    pub fn wrap(&self, source: BoxedStage) -> BoxedStage {
        self.factories
            .iter()
            .fold(source, |upstream, factory| factory.wrap(upstream))
    }
}

/// Shared handles built from [`StagesConfig`]
///
/// The runtime keeps these to serve reloads and to add per-request stages.
pub struct ConfiguredStages {
    /// Fan-out rules; always present so rules can be loaded later
    pub selector: Arc<EventSelector>,
    /// IP masking
    pub anonymizer: Option<Arc<Anonymizer>>,
    /// Extra JSON fields
    pub enricher: Option<Arc<Enricher>>,
    /// Schema validation
    pub schemas: Option<Arc<SchemaRegistry>>,
    /// Record-derived counters
    pub extractor: Option<Arc<MetricsExtractor>>,
}

impl ConfiguredStages {
    /// Build every configured stage
    ///
    /// `invalid_topic` is the schema fallback destination; exporters
    /// register their counters into `registry` when one is given.
    pub fn from_config(
        config: &StagesConfig,
        invalid_topic: &str,
        registry: Option<&Registry>,
    ) -> Result<Self> {
        let selector = Arc::new(EventSelector::new(config.event_selectors.clone()));

        let anonymizer = config
            .anonymize
            .as_ref()
            .map(|c| Anonymizer::from_config(c).map(Arc::new))
            .transpose()?;

        let enricher = config
            .extra_fields
            .as_ref()
            .map(|c| Arc::new(Enricher::from_config(c, Arc::new(SequenceManager::new()))));

        let schemas = config
            .schema
            .as_ref()
            .map(|c| SchemaRegistry::from_config(c, invalid_topic).map(Arc::new))
            .transpose()?;

        let extractor = if config.exporters.is_empty() {
            None
        } else {
            let owned;
            let registry = match registry {
                Some(r) => r,
                None => {
                    owned = Registry::new();
                    &owned
                }
            };
            Some(Arc::new(MetricsExtractor::new(config.exporters.clone(), registry)?))
        };

        Ok(Self {
            selector,
            anonymizer,
            enricher,
            schemas,
            extractor,
        })
    }

    /// Chain in the fixed order: selector, anonymize, enrich, schema, extract
    pub fn chain(&self) -> StageChain {
        let mut chain = StageChain::new();
        chain.add(self.selector.clone());
        if let Some(a) = &self.anonymizer {
            chain.add(a.clone());
        }
        if let Some(e) = &self.enricher {
            chain.add(e.clone());
        }
        if let Some(s) = &self.schemas {
            chain.add(s.clone());
        }
        if let Some(x) = &self.extractor {
            chain.add(x.clone());
        }
        chain
    }
}

/// Resolve a dot-separated path (`payload.action_name`, `items.0.id`)
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use edgeproxy_core::{collect, Event, StageError, VecStage};
    use serde_json::json;

    /// Uppercases every payload
    struct Upper;

    struct UpperStage {
        upstream: BoxedStage,
        current: Option<Event>,
    }

    impl EventStage for UpperStage {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn advance(&mut self) -> bool {
            if !self.upstream.advance() {
                return false;
            }
            self.current = self.upstream.current().map(|e| {
                let upper = e.message.to_ascii_uppercase();
                e.derive(e.topic.clone(), upper.into())
            });
            true
        }

        fn current(&self) -> Option<&Event> {
            self.current.as_ref()
        }

        fn error(&self) -> Option<&StageError> {
            self.upstream.error()
        }
    }

    impl StageFactory for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
            Box::new(UpperStage {
                upstream,
                current: None,
            })
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = StageChain::new();
        assert!(chain.is_empty());

        let mut stage = chain.wrap(Box::new(VecStage::new(vec![Event::new("t", "a", 0)])));
        let (events, err) = collect(&mut stage);
        assert_eq!(events.len(), 1);
        assert!(err.is_none());
    }

    #[test]
    fn test_chain_applies_in_order() {
        let chain = StageChain::new().with(Arc::new(Upper));
        assert_eq!(chain.names(), vec!["upper"]);

        let source = VecStage::new(vec![Event::new("t", "ab", 0)])
            .with_error(StageError::Aborted("end".into()));
        let mut stage = chain.wrap(Box::new(source));
        let (events, err) = collect(&mut stage);

        assert_eq!(&events[0].message[..], b"AB");
        assert_eq!(err, Some(StageError::Aborted("end".into())));
    }

    #[test]
    fn test_configured_stages_order() {
        let config: StagesConfig = serde_yaml::from_str(
            r#"
anonymize: {}
extra_fields:
  fields: { source: edge }
schema:
  validate_topics: [events]
exporters:
  - metric: { name: test_events_total, help: events }
    topics: [events]
    aggregations:
      - { name: event, paths: [event] }
"#,
        )
        .unwrap();

        let stages = ConfiguredStages::from_config(&config, "malformed", None).unwrap();
        assert_eq!(
            stages.chain().names(),
            vec!["selector", "anonymize", "enrich", "schema", "extract"]
        );
    }

    #[test]
    fn test_default_config_has_selector_only() {
        let stages =
            ConfiguredStages::from_config(&StagesConfig::default(), "malformed", None).unwrap();
        assert_eq!(stages.chain().names(), vec!["selector"]);
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({
            "event": "test",
            "payload": { "action_name": "click", "items": [{ "id": "x" }] }
        });

        assert_eq!(lookup_path(&value, "event"), Some(&json!("test")));
        assert_eq!(
            lookup_path(&value, "payload.action_name"),
            Some(&json!("click"))
        );
        assert_eq!(lookup_path(&value, "payload.items.0.id"), Some(&json!("x")));
        assert_eq!(lookup_path(&value, "payload.missing"), None);
        assert_eq!(lookup_path(&value, "event.deeper"), None);
    }
}
