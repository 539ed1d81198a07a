//! Transports to the downstream broker gateway
//!
//! A [`Transport`] drains an [`EventStage`] into the broker and reports how
//! many records were accepted. Two implementations exist:
//!
//! - [`GrpcTransport`]: one bidirectional `Produce` stream per call, acks
//!   drained concurrently with sending
//! - [`HttpTransport`]: one `POST` per record
//!
//! [`BrokerTransport`] is the variant resolved once from the configured URL.

pub mod filter;
pub mod grpc;
pub mod http;

pub use filter::{Filtered, JsonValidationFilter};
pub use grpc::GrpcTransport;
pub use http::HttpTransport;

use crate::config::{ProxyConfig, TransportConfig};
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use async_trait::async_trait;
use edgeproxy_core::EventStage;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Counters of one `send_events` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Records handed to the broker gateway (empty records are skipped)
    pub attempted: u64,
    /// Records the broker gateway accepted
    pub confirmed: u64,
    /// Records rerouted by the JSON validation filter
    pub filtered: u64,
    /// Source offset of the last accepted record
    pub last_confirmed_offset: Option<u64>,
}

impl Delivery {
    /// Records handed over but not accepted
    pub fn rejected(&self) -> u64 {
        self.attempted.saturating_sub(self.confirmed)
    }
}

/// A failed send, with the counts accumulated before the failure
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DeliveryError {
    /// Counts up to the failure
    pub delivery: Delivery,
    /// The single terminal cause
    #[source]
    pub error: ProxyError,
}

impl DeliveryError {
    /// Pair partial counts with a cause
    pub fn new(delivery: Delivery, error: ProxyError) -> Self {
        Self { delivery, error }
    }

    /// See [`ProxyError::is_transport_failure`]
    pub fn is_transport_failure(&self) -> bool {
        self.error.is_transport_failure()
    }

    /// See [`ProxyError::is_circuit_open`]
    pub fn is_circuit_open(&self) -> bool {
        self.error.is_circuit_open()
    }
}

/// Pick the terminal result of a send: a transport error wins over a
/// source error, and either turns the counts into a [`DeliveryError`]
pub(crate) fn finish(
    delivery: Delivery,
    transport_error: Option<ProxyError>,
    source_error: Option<edgeproxy_core::StageError>,
) -> std::result::Result<Delivery, DeliveryError> {
    match (transport_error, source_error) {
        (Some(error), _) => Err(DeliveryError::new(delivery, error)),
        (None, Some(error)) => Err(DeliveryError::new(delivery, ProxyError::Source(error))),
        (None, None) => Ok(delivery),
    }
}

/// Downstream broker client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and metric labels
    fn name(&self) -> &'static str;

    /// Drain `stage` into the broker
    ///
    /// Applies the JSON validation filter to every record. Stops at the
    /// first transport failure. A stage error ends the call with
    /// [`ProxyError::Source`] after the records before it were sent.
    async fn send_events(
        &self,
        stage: &mut dyn EventStage,
    ) -> std::result::Result<Delivery, DeliveryError>;

    /// Topics known to the broker
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Replace the set of topics whose records must be well-formed JSON
    fn set_validate_json_topics(&self, topics: HashMap<String, bool>);

    /// Current JSON validation map
    fn validate_json_topics(&self) -> HashMap<String, bool>;
}

/// Transport chosen from the URL scheme
pub enum BrokerTransport {
    /// Streaming gRPC
    Grpc(GrpcTransport),
    /// Request/response HTTP
    Http(HttpTransport),
}

impl BrokerTransport {
    /// Build the transport named by `config.url`
    ///
    /// Must be called inside a Tokio runtime (the gRPC channel spawns its
    /// worker lazily on the current runtime).
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        match config.transport() {
            TransportConfig::Grpc { endpoint, config: grpc } => Ok(BrokerTransport::Grpc(
                GrpcTransport::new(&endpoint, grpc, &config.invalid_messages_topic)?,
            )),
            TransportConfig::Http { base_url, config: http } => Ok(BrokerTransport::Http(
                HttpTransport::new(&base_url, http, &config.invalid_messages_topic)?,
            )),
        }
    }

    /// Attach metrics (recorded only when the protocol config enables them)
    pub fn with_metrics(self, metrics: Arc<ProxyMetrics>) -> Self {
        match self {
            BrokerTransport::Grpc(t) => BrokerTransport::Grpc(t.with_metrics(metrics)),
            BrokerTransport::Http(t) => BrokerTransport::Http(t.with_metrics(metrics)),
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &'static str {
        match self {
            BrokerTransport::Grpc(t) => t.name(),
            BrokerTransport::Http(t) => t.name(),
        }
    }

    async fn send_events(
        &self,
        stage: &mut dyn EventStage,
    ) -> std::result::Result<Delivery, DeliveryError> {
        match self {
            BrokerTransport::Grpc(t) => t.send_events(stage).await,
            BrokerTransport::Http(t) => t.send_events(stage).await,
        }
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        match self {
            BrokerTransport::Grpc(t) => t.list_topics().await,
            BrokerTransport::Http(t) => t.list_topics().await,
        }
    }

    fn set_validate_json_topics(&self, topics: HashMap<String, bool>) {
        match self {
            BrokerTransport::Grpc(t) => t.set_validate_json_topics(topics),
            BrokerTransport::Http(t) => t.set_validate_json_topics(topics),
        }
    }

    fn validate_json_topics(&self) -> HashMap<String, bool> {
        match self {
            BrokerTransport::Grpc(t) => t.validate_json_topics(),
            BrokerTransport::Http(t) => t.validate_json_topics(),
        }
    }
}
