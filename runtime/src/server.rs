//! HTTP ingestion surface
//!
//! # Endpoints
//!
//! - `POST /topics/{topic}/events` - decode the body, run the stage chain,
//!   deliver through the proxy. A `Content-Encoding: gzip` body is inflated
//!   first and the summary carries its compressed size and MD5.
//! - `GET /topics` - valid topics, sorted
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - `{"status": "ok"|"degraded", "circuit": "<state>"}`
//!
//! The metrics listener serves only `/metrics` and `/health`.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use edgeproxy_gateway::decode::{Decoder, DecoderOptions};
use edgeproxy_gateway::gzip::{BodyDigest, GzipHashReader};
use edgeproxy_gateway::proxy::{CircuitState, KafkaProxy};
use edgeproxy_gateway::stage::{BoxedStage, StageChain};
use edgeproxy_gateway::transport::{BrokerTransport, Delivery, Transport};
use prometheus::Registry;
use serde::Serialize;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state of the HTTP handlers
pub struct AppState<T = BrokerTransport> {
    /// Delivery and admission
    pub proxy: Arc<KafkaProxy<T>>,
    /// Stages wrapped around every request's decoder
    pub stages: StageChain,
    /// Framing of request bodies
    pub decoder: DecoderOptions,
    /// Registry rendered by `/metrics`
    pub registry: Registry,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            proxy: Arc::clone(&self.proxy),
            stages: self.stages.clone(),
            decoder: self.decoder,
            registry: self.registry.clone(),
        }
    }
}

/// Response body of a send
#[derive(Debug, Serialize)]
struct SendSummary {
    attempted: u64,
    confirmed: u64,
    filtered: u64,
    rejected: u64,
    last_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Compressed bytes read, gzip bodies only
    #[serde(skip_serializing_if = "Option::is_none")]
    body_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body_md5: Option<String>,
}

impl SendSummary {
    fn new(delivery: Delivery, error: Option<String>, digest: Option<&BodyDigest>) -> Self {
        Self {
            attempted: delivery.attempted,
            confirmed: delivery.confirmed,
            filtered: delivery.filtered,
            rejected: delivery.rejected(),
            last_offset: delivery.last_confirmed_offset,
            error,
            body_bytes: digest.map(BodyDigest::bytes_read),
            body_md5: digest.map(BodyDigest::hex),
        }
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Router with every ingestion endpoint
pub fn router<T: Transport + 'static>(state: AppState<T>) -> Router {
    Router::new()
        .route("/topics/{topic}/events", post(post_events::<T>))
        .route("/topics", get(list_topics::<T>))
        .route("/metrics", get(metrics::<T>))
        .route("/health", get(health::<T>))
        .with_state(state)
}

/// Router for the metrics listener
pub fn metrics_router<T: Transport + 'static>(state: AppState<T>) -> Router {
    Router::new()
        .route("/metrics", get(metrics::<T>))
        .route("/health", get(health::<T>))
        .with_state(state)
}

async fn post_events<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.proxy.is_topic_valid(&topic) {
        debug!(%topic, "rejected unknown topic");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown topic: {topic}") })),
        )
            .into_response();
    }

    let (decoder, digest) = if is_gzip(&headers) {
        let reader = GzipHashReader::new(Cursor::new(body));
        let digest = reader.digest();
        let decoder: BoxedStage =
            Box::new(Decoder::with_options(reader, topic.as_str(), state.decoder));
        (decoder, Some(digest))
    } else {
        let decoder: BoxedStage =
            Box::new(Decoder::with_options(Cursor::new(body), topic.as_str(), state.decoder));
        (decoder, None)
    };
    let mut stage = state.stages.wrap(decoder);

    let result = state.proxy.send_events(&mut stage).await;
    if let Some(digest) = &digest {
        debug!(%topic, bytes = digest.bytes_read(), md5 = %digest.hex(), "gzip body read");
    }
    match result {
        Ok(delivery) => {
            let summary = SendSummary::new(delivery, None, digest.as_ref());
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(e) => {
            let status = if e.is_circuit_open() {
                StatusCode::SERVICE_UNAVAILABLE
            } else if e.is_transport_failure() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::BAD_REQUEST
            };
            warn!(%topic, error = %e, status = status.as_u16(), "send failed");
            let summary = SendSummary::new(e.delivery, Some(e.to_string()), digest.as_ref());
            (status, Json(summary)).into_response()
        }
    }
}

async fn list_topics<T: Transport + 'static>(State(state): State<AppState<T>>) -> Json<Vec<String>> {
    Json(state.proxy.topics())
}

async fn metrics<T: Transport + 'static>(State(state): State<AppState<T>>) -> Response {
    match edgeproxy_gateway::metrics::gather(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health<T: Transport + 'static>(State(state): State<AppState<T>>) -> Json<serde_json::Value> {
    let circuit = state.proxy.breaker().current_state();
    let status = if circuit == CircuitState::Closed {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({ "status": status, "circuit": circuit.as_str() }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use edgeproxy_core::EventStage;
    use edgeproxy_gateway::config::{ProxyConfig, TopicConfig};
    use edgeproxy_gateway::error::{ProxyError, Result};
    use edgeproxy_gateway::metrics::ProxyMetrics;
    use edgeproxy_gateway::proxy::BackoffConfig;
    use edgeproxy_gateway::stage::{EventSelector, SelectorConfig};
    use edgeproxy_gateway::transport::DeliveryError;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct MockBroker {
        sent: Mutex<Vec<(String, String, u64)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Transport for MockBroker {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn send_events(
            &self,
            stage: &mut dyn EventStage,
        ) -> std::result::Result<Delivery, DeliveryError> {
            let mut delivery = Delivery::default();
            while stage.advance() {
                let Some(event) = stage.current() else {
                    continue;
                };
                delivery.attempted += 1;
                if self.failing.load(Ordering::SeqCst) {
                    return Err(DeliveryError::new(
                        delivery,
                        ProxyError::HttpStatus {
                            status: 503,
                            url: "mock".into(),
                        },
                    ));
                }
                self.sent.lock().unwrap().push((
                    event.topic.clone(),
                    event.message_str().unwrap_or_default().to_string(),
                    event.offset,
                ));
                delivery.confirmed += 1;
                delivery.last_confirmed_offset = Some(event.offset);
            }
            match stage.error() {
                Some(e) => Err(DeliveryError::new(delivery, e.clone().into())),
                None => Ok(delivery),
            }
        }

        async fn list_topics(&self) -> Result<Vec<String>> {
            Ok(vec!["dynamic".to_string()])
        }

        fn set_validate_json_topics(&self, _topics: HashMap<String, bool>) {}

        fn validate_json_topics(&self) -> HashMap<String, bool> {
            HashMap::new()
        }
    }

    fn state(max_fails: u32, stages: StageChain) -> AppState<MockBroker> {
        let config = ProxyConfig {
            topics: vec![TopicConfig::new("events", "json", false)],
            circuitbreaker_max_fails: max_fails,
            backoff: BackoffConfig::fixed(Duration::from_secs(60), Duration::from_secs(60)),
            ..Default::default()
        };
        let registry = Registry::new();
        let metrics = Arc::new(ProxyMetrics::register(&registry).unwrap());
        let proxy = KafkaProxy::with_metrics(MockBroker::default(), &config, metrics).unwrap();

        AppState {
            proxy: Arc::new(proxy),
            stages,
            decoder: DecoderOptions::default(),
            registry,
        }
    }

    async fn send(app: Router, uri: &str, body: &'static str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn send_gzip(
        app: Router,
        uri: &str,
        raw: &[u8],
    ) -> (StatusCode, serde_json::Value, Vec<u8>) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let gz = encoder.finish().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-encoding", "GZIP")
                    .body(Body::from(gz.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap(), gz)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_post_events_delivers_records() {
        let state = state(3, StageChain::new());
        let app = router(state.clone());

        let (status, body) = send(app, "/topics/events/events", "{\"a\":1}\n{\"b\":2}").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attempted"], 2);
        assert_eq!(body["confirmed"], 2);
        assert_eq!(body["rejected"], 0);
        assert_eq!(body["last_offset"], 8);

        let sent = state.proxy.transport().sent.lock().unwrap().clone();
        assert_eq!(sent[1], ("events".to_string(), "{\"b\":2}".to_string(), 8));
    }

    #[tokio::test]
    async fn test_gzip_body_inflated_and_hashed() {
        let state = state(3, StageChain::new());

        let raw = b"{\"a\":1}\n{\"b\":2}";
        let app = router(state.clone());
        let (status, body, gz) = send_gzip(app, "/topics/events/events", raw).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmed"], 2);
        assert_eq!(body["last_offset"], 8);
        assert_eq!(body["body_bytes"], gz.len() as u64);
        let md5 = body["body_md5"].as_str().unwrap();
        assert_eq!(md5.len(), 32);
        assert!(md5.chars().all(|c| c.is_ascii_hexdigit()));

        let sent = state.proxy.transport().sent.lock().unwrap().clone();
        assert_eq!(sent[0], ("events".to_string(), "{\"a\":1}".to_string(), 0));
    }

    #[tokio::test]
    async fn test_plain_body_has_no_digest() {
        let app = router(state(3, StageChain::new()));
        let (status, body) = send(app, "/topics/events/events", "a").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("body_bytes").is_none());
        assert!(body.get("body_md5").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_gzip_body_is_400() {
        let app = router(state(3, StageChain::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/events/events")
                    .header("content-encoding", "gzip")
                    .body(Body::from("{\"a\":1}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["attempted"], 0);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_topic_is_404() {
        let app = router(state(3, StageChain::new()));
        let (status, body) = send(app, "/topics/nope/events", "x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown topic: nope");
    }

    #[tokio::test]
    async fn test_transport_failure_then_open_circuit() {
        let state = state(1, StageChain::new());
        state.proxy.transport().failing.store(true, Ordering::SeqCst);

        let (status, body) = send(router(state.clone()), "/topics/events/events", "a").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["attempted"], 1);
        assert_eq!(body["rejected"], 1);

        let (status, _) = send(router(state.clone()), "/topics/events/events", "a").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (_, health) = get_text(router(state), "/health").await;
        let health: serde_json::Value = serde_json::from_str(&health).unwrap();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["circuit"], "open");
    }

    #[tokio::test]
    async fn test_stages_applied_to_request() {
        let selector = Arc::new(EventSelector::new(vec![SelectorConfig::new(
            "dynamic",
            [("event", "click")],
        )]));
        let state = state(3, StageChain::new().with(selector));

        let (status, body) =
            send(router(state.clone()), "/topics/events/events", "{\"event\":\"click\"}").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmed"], 2);

        let sent = state.proxy.transport().sent.lock().unwrap().clone();
        assert_eq!(sent[1].0, "dynamic");
    }

    #[tokio::test]
    async fn test_topics_include_dynamic_list() {
        let state = state(3, StageChain::new());
        state.proxy.refresh_topics().await.unwrap();

        let (status, body) = get_text(router(state), "/topics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[\"dynamic\",\"events\"]");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let state = state(3, StageChain::new());

        let (status, body) = get_text(metrics_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\"status\":\"ok\",\"circuit\":\"closed\"}");

        let (status, body) = get_text(metrics_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("edgeproxy_circuit_breaker_state 0"));
    }
}
