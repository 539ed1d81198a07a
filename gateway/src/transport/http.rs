//! HTTP transport to the broker gateway
//!
//! Each record is one `POST {base}/topics/{topic}/messages` with the raw
//! payload as a `text/plain` body. The first failed request ends the call.

use super::filter::JsonValidationFilter;
use super::{finish, Delivery, DeliveryError, Transport};
use crate::config::HttpConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use async_trait::async_trait;
use edgeproxy_core::EventStage;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const NAME: &str = "http";

/// Request/response HTTP transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    base: Url,
    config: HttpConfig,
    filter: JsonValidationFilter,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl HttpTransport {
    /// Create a transport for `base_url` (trailing slashes are dropped)
    pub fn new(base_url: &str, config: HttpConfig, invalid_topic: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches(['/', ' ']).to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| ProxyError::Config(format!("invalid broker url {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProxyError::Config(format!(
                "broker url {base_url:?} cannot carry a path"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            base,
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

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base` with `segments` appended, each percent-encoded
    fn url_with(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ProxyError::Config(format!("broker url {:?} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn messages_url(&self, topic: &str) -> Result<Url> {
        self.url_with(&["topics", topic.trim_matches(['/', ' ']), "messages"])
    }

    fn metrics(&self) -> Option<&ProxyMetrics> {
        self.metrics
            .as_deref()
            .filter(|_| self.config.enable_metrics)
    }

    async fn post(&self, topic: &str, message: bytes::Bytes) -> Result<()> {
        let url = self.messages_url(topic)?;
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "text/plain")
            .body(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_events(
        &self,
        stage: &mut dyn EventStage,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let started = Instant::now();
        let metrics = self.metrics();
        let mut delivery = Delivery::default();
        let mut transport_error = None;

        while stage.advance() {
            let Some(event) = stage.current() else {
                continue;
            };
            if event.is_empty() {
                continue;
            }

            let out = self.filter.apply(event.clone());
            if out.rerouted {
                delivery.filtered += 1;
                if let Some(m) = metrics {
                    m.record_filtered(&event.topic);
                }
            }

            delivery.attempted += 1;
            match self.post(&out.event.topic, out.event.message).await {
                Ok(()) => {
                    delivery.confirmed += 1;
                    delivery.last_confirmed_offset = Some(out.event.offset);
                }
                Err(e) => {
                    warn!(
                        base_url = %self.base_url,
                        topic = %out.event.topic,
                        error = %e,
                        "message post failed"
                    );
                    transport_error = Some(e);
                    break;
                }
            }
        }

        if let Some(m) = metrics {
            m.record_sent(NAME, delivery.attempted);
            m.record_confirmed(NAME, delivery.confirmed);
            m.record_send_duration(NAME, started.elapsed().as_secs_f64());
        }
        debug!(
            attempted = delivery.attempted,
            confirmed = delivery.confirmed,
            filtered = delivery.filtered,
            "http send finished"
        );

        let source_error = if transport_error.is_none() {
            stage.error().cloned()
        } else {
            None
        };
        finish(delivery, transport_error, source_error)
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let url = self.url_with(&["topics"])?;
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await?;
        Ok(body
            .split('\n')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn set_validate_json_topics(&self, topics: HashMap<String, bool>) {
        self.filter.set_topics(topics);
    }

    fn validate_json_topics(&self) -> HashMap<String, bool> {
        self.filter.topics()
    }
}
