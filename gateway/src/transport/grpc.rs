//! gRPC transport to the KafkaAmbassador broker gateway
//!
//! One `send_events` call opens one bidirectional `Produce` stream. Two
//! futures run side by side until both finish:
//!
//! ```text
//!  stage ──advance──► send ──ProdRq──► mpsc ──► Produce stream ──► broker
//!                                                                    │
//!  Delivery ◄── recv ◄──────────────── ProdRs{stream_offset} ◄───────┘
//! ```
//!
//! The send side half-closes the stream once the stage is exhausted; the
//! receive side ends on the broker's end-of-stream or on a stream error.

use super::filter::JsonValidationFilter;
use super::{finish, Delivery, DeliveryError, Transport};
use crate::config::GrpcConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::proto::kafka_ambassador_client::KafkaAmbassadorClient;
use crate::proto::{Empty, ProdRq};
use async_trait::async_trait;
use edgeproxy_core::EventStage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

/// Records buffered between the stage and the stream
const SEND_QUEUE_DEPTH: usize = 256;

const NAME: &str = "grpc";

/// Streaming gRPC transport
pub struct GrpcTransport {
    client: KafkaAmbassadorClient<Channel>,
    endpoint: String,
    config: GrpcConfig,
    filter: JsonValidationFilter,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl GrpcTransport {
    /// Create a transport with a lazily connected channel
    ///
    /// `endpoint` uses the `http://` scheme. Must be called inside a Tokio
    /// runtime.
    pub fn new(endpoint: &str, config: GrpcConfig, invalid_topic: &str) -> Result<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .connect_lazy();

        debug!(endpoint = %endpoint, "gRPC transport configured (lazy)");

        Ok(Self {
            client: KafkaAmbassadorClient::new(channel),
            endpoint: endpoint.to_string(),
            config,
            filter: JsonValidationFilter::new(invalid_topic),
            metrics: None,
        })
    }

    /// Attach metrics; recorded when `enable_metrics` is set
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Channel endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn metrics(&self) -> Option<&ProxyMetrics> {
        self.metrics
            .as_deref()
            .filter(|_| self.config.enable_metrics)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_events(
        &self,
        stage: &mut dyn EventStage,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel::<ProdRq>(SEND_QUEUE_DEPTH);
        let mut client = self.client.clone();
        let filter = &self.filter;
        let metrics = self.metrics();

        let send = async move {
            let mut attempted = 0u64;
            let mut filtered = 0u64;

            while stage.advance() {
                let Some(event) = stage.current() else {
                    continue;
                };
                if event.is_empty() {
                    continue;
                }

                let original_topic = event.topic.clone();
                let out = filter.apply(event.clone());
                if out.rerouted {
                    filtered += 1;
                    if let Some(m) = metrics {
                        m.record_filtered(&original_topic);
                    }
                }

                let request = ProdRq {
                    topic: out.event.topic,
                    message: out.event.message,
                    stream_offset: out.event.offset,
                };
                if tx.send(request).await.is_err() {
                    // the stream is gone; its status surfaces on the receive side
                    break;
                }
                attempted += 1;
            }

            // half-close
            drop(tx);
            (attempted, filtered, stage.error().cloned())
        };

        let recv = async move {
            let mut confirmed = 0u64;
            let mut last_offset = None;

            let response = match client.produce(ReceiverStream::new(rx)).await {
                Ok(response) => response,
                Err(status) => return (confirmed, last_offset, Some(ProxyError::from(status))),
            };

            let mut acks = response.into_inner();
            loop {
                match acks.message().await {
                    Ok(Some(ack)) => {
                        confirmed += 1;
                        last_offset = Some(ack.stream_offset);
                    }
                    Ok(None) => break,
                    Err(status) => return (confirmed, last_offset, Some(status.into())),
                }
            }
            (confirmed, last_offset, None)
        };

        let ((attempted, filtered, source_error), (confirmed, last_offset, transport_error)) =
            tokio::join!(send, recv);

        let delivery = Delivery {
            attempted,
            confirmed,
            filtered,
            last_confirmed_offset: last_offset,
        };

        if let Some(m) = metrics {
            m.record_sent(NAME, attempted);
            m.record_confirmed(NAME, confirmed);
            if self.config.enable_histogram {
                m.record_send_duration(NAME, started.elapsed().as_secs_f64());
            }
        }

        if let Some(ref e) = transport_error {
            warn!(
                endpoint = %self.endpoint,
                attempted,
                confirmed,
                error = %e,
                "produce stream failed"
            );
        } else {
            debug!(attempted, confirmed, filtered, "produce stream finished");
        }

        finish(delivery, transport_error, source_error)
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let response = client.list_topics(Empty {}).await?;
        Ok(response.into_inner().topics)
    }

    fn set_validate_json_topics(&self, topics: HashMap<String, bool>) {
        self.filter.set_topics(topics);
    }

    fn validate_json_topics(&self) -> HashMap<String, bool> {
        self.filter.topics()
    }
}
