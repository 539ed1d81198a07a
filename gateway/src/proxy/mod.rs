//! KafkaProxy: admission control in front of a [`Transport`]
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────── KafkaProxy ───────────────────┐
//!  stage ────────►│ CircuitBreaker ──try_acquire──► Transport ──────► │──► broker
//!                 │       ▲                             │             │
//!                 │       └──── permit success/failure ──┘            │
//!                 │                                                   │
//!                 │ topics: static ∪ dynamic ◄── refresh loop ◄────── │◄── list_topics
//!                 └───────────────────────────────────────────────────┘
//! ```
//!
//! The dynamic topic list is published as a fresh `Arc<HashSet>` on every
//! refresh; admission checks read a snapshot and never see a partial list.

mod backoff;
mod breaker;

pub use backoff::BackoffConfig;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::transport::{BrokerTransport, Delivery, DeliveryError, Transport};
use edgeproxy_core::EventStage;
use parking_lot::RwLock;
use prometheus::Registry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// State shared between the send path and the refresh loop
struct Shared<T> {
    transport: T,
    static_topics: HashSet<String>,
    dynamic_topics: RwLock<Arc<HashSet<String>>>,
    breaker: CircuitBreaker,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl<T: Transport> Shared<T> {
    async fn refresh(&self) -> Result<usize> {
        let topics: HashSet<String> = self.transport.list_topics().await?.into_iter().collect();
        let count = topics.len();
        *self.dynamic_topics.write() = Arc::new(topics);

        if let Some(m) = &self.metrics {
            m.set_dynamic_topics(count);
        }
        Ok(count)
    }
}

/// Circuit-breaking, topic-gating proxy to the broker gateway
pub struct KafkaProxy<T = BrokerTransport> {
    shared: Arc<Shared<T>>,
    refresh_task: JoinHandle<()>,
}

impl KafkaProxy<BrokerTransport> {
    /// Build the transport named by `config.url` and wrap it
    ///
    /// With a registry, proxy and transport metrics are registered into it.
    pub fn from_config(config: &ProxyConfig, registry: Option<&Registry>) -> Result<Self> {
        require_runtime()?;
        config.validate()?;

        let metrics = registry
            .map(ProxyMetrics::register)
            .transpose()?
            .map(Arc::new);

        let mut transport = BrokerTransport::from_config(config)?;
        if let Some(m) = &metrics {
            transport = transport.with_metrics(Arc::clone(m));
        }

        Self::build(transport, config, metrics)
    }
}

impl<T: Transport + 'static> KafkaProxy<T> {
    /// Wrap an existing transport
    ///
    /// Pushes the JSON validation map into the transport and starts the
    /// topic refresh loop on the current Tokio runtime.
    pub fn new(transport: T, config: &ProxyConfig) -> Result<Self> {
        Self::build(transport, config, None)
    }

    /// Like [`KafkaProxy::new`], recording breaker and topic metrics
    pub fn with_metrics(transport: T, config: &ProxyConfig, metrics: Arc<ProxyMetrics>) -> Result<Self> {
        Self::build(transport, config, Some(metrics))
    }

    fn build(transport: T, config: &ProxyConfig, metrics: Option<Arc<ProxyMetrics>>) -> Result<Self> {
        let handle = require_runtime()?;
        config.validate()?;

        transport.set_validate_json_topics(config.validate_json_topics());

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuitbreaker_max_fails,
            backoff: config.backoff.clone(),
        });
        if let Some(m) = &metrics {
            m.set_circuit_state(breaker.current_state());
        }

        let shared = Arc::new(Shared {
            transport,
            static_topics: config.topic_names().into_iter().collect(),
            dynamic_topics: RwLock::new(Arc::new(HashSet::new())),
            breaker,
            metrics,
        });

        let refresh_task = handle.spawn(refresh_loop(
            Arc::clone(&shared),
            config.topic_refresh_interval,
        ));

        info!(
            transport = shared.transport.name(),
            static_topics = shared.static_topics.len(),
            max_fails = config.circuitbreaker_max_fails,
            refresh_interval_secs = config.topic_refresh_interval.as_secs(),
            "kafka proxy started"
        );

        Ok(Self {
            shared,
            refresh_task,
        })
    }

    /// True if `topic` is statically configured or known to the broker
    pub fn is_topic_valid(&self, topic: &str) -> bool {
        self.shared.static_topics.contains(topic)
            || self.shared.dynamic_topics.read().contains(topic)
    }

    /// All valid topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let dynamic = Arc::clone(&self.shared.dynamic_topics.read());
        let mut topics: Vec<String> = self
            .shared
            .static_topics
            .union(&dynamic)
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Fetch the broker's topic list now
    ///
    /// On error the previous list is kept.
    pub async fn refresh_topics(&self) -> Result<usize> {
        self.shared.refresh().await
    }

    /// Send every record of `stage` through the transport
    ///
    /// While the circuit is open this returns [`ProxyError::CircuitOpen`]
    /// with zero counts and never touches the transport. Only transport
    /// failures count against the breaker; a clean end or a source error
    /// counts as success.
    pub async fn send_events<S: EventStage>(
        &self,
        stage: &mut S,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let breaker = &self.shared.breaker;
        let metrics = self.shared.metrics.as_deref();

        let Some(permit) = breaker.try_acquire() else {
            if let Some(m) = metrics {
                m.record_circuit_rejected();
                m.set_circuit_state(breaker.current_state());
            }
            debug!(stage = stage.name(), "send rejected, circuit open");
            return Err(DeliveryError::new(Delivery::default(), ProxyError::CircuitOpen));
        };
        if let Some(m) = metrics {
            m.set_circuit_state(breaker.current_state());
        }

        let stage: &mut dyn EventStage = stage;
        let result = self.shared.transport.send_events(stage).await;

        // a dropped future releases the permit without a result
        match &result {
            Err(e) if e.is_transport_failure() => permit.failure(),
            _ => permit.success(),
        }
        if let Some(m) = metrics {
            m.set_circuit_state(breaker.current_state());
        }

        result
    }

    /// The circuit breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    /// The wrapped transport
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T> Drop for KafkaProxy<T> {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

fn require_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| ProxyError::Config(format!("kafka proxy needs a Tokio runtime: {e}")))
}

/// Periodically replace the dynamic topic list; first fetch is immediate
async fn refresh_loop<T: Transport>(shared: Arc<Shared<T>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match shared.refresh().await {
            Ok(count) => debug!(topics = count, "topic list refreshed"),
            Err(e) => warn!(error = %e, "topic refresh failed, keeping previous list"),
        }
    }
}
