//! HTTP transport flow tests against an in-process axum broker gateway

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use edgeproxy_gateway::stage::{EventSelector, SelectorConfig, StageChain};
use edgeproxy_gateway::{CircuitState, Decoder, FileConfig, KafkaProxy, ProxyError};
use prometheus::Registry;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Gateway {
    posts: Arc<Mutex<Vec<(String, String)>>>,
    down: Arc<AtomicBool>,
}

async fn post_message(
    State(gateway): State<Gateway>,
    Path(topic): Path<String>,
    body: String,
) -> StatusCode {
    if gateway.down.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    gateway.posts.lock().unwrap().push((topic, body));
    StatusCode::NO_CONTENT
}

async fn start_gateway(gateway: Gateway) -> SocketAddr {
    let app = Router::new()
        .route("/topics/{topic}/messages", post(post_message))
        .route("/topics", get(|| async { "orders\npayments\n" }))
        .with_state(gateway);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn proxy(addr: SocketAddr, registry: Option<&Registry>) -> KafkaProxy {
    let config = FileConfig::from_yaml(&format!(
        r#"
proxy:
  url: http://{addr}/
  circuitbreaker_max_fails: 1
  topic_refresh_interval: 1h
  topics:
    - {{ name: events, format: json }}
  backoff: {{ initial_delay: 1h, max_delay: 1h, jitter_factor: 0.0 }}
"#
    ))
    .unwrap();
    KafkaProxy::from_config(&config.proxy, registry).unwrap()
}

#[tokio::test]
async fn test_records_posted_one_by_one() {
    let gateway = Gateway::default();
    let addr = start_gateway(gateway.clone()).await;
    let registry = Registry::new();
    let proxy = proxy(addr, Some(&registry));

    let selector = Arc::new(EventSelector::new(vec![SelectorConfig::new(
        "orders",
        [("kind", "order")],
    )]));
    let chain = StageChain::new().with(selector);
    let mut stage = chain.wrap(Box::new(Decoder::new(
        Cursor::new("{\"kind\":\"order\"}\n{\"kind\":\"view\"}".to_string()),
        "events",
    )));

    let delivery = proxy.send_events(&mut stage).await.unwrap();
    assert_eq!(delivery.attempted, 3);
    assert_eq!(delivery.confirmed, 3);

    let posts = gateway.posts.lock().unwrap().clone();
    let topics: Vec<&str> = posts.iter().map(|p| p.0.as_str()).collect();
    assert_eq!(topics, vec!["events", "orders", "events"]);
    assert_eq!(posts[0].1, "{\"kind\":\"order\"}");

    let text = edgeproxy_gateway::metrics::gather(&registry).unwrap();
    assert!(text.contains("edgeproxy_events_sent_total{transport=\"http\"} 3"));
    assert!(text.contains("edgeproxy_send_duration_seconds_count{transport=\"http\"} 1"));
}

#[tokio::test]
async fn test_server_error_trips_breaker() {
    let gateway = Gateway::default();
    gateway.down.store(true, Ordering::SeqCst);
    let addr = start_gateway(gateway.clone()).await;
    let proxy = proxy(addr, None);

    let mut stage = Decoder::new(Cursor::new("a\nb".to_string()), "events");
    let err = proxy.send_events(&mut stage).await.unwrap_err();

    assert!(matches!(err.error, ProxyError::HttpStatus { status: 500, .. }));
    assert_eq!(err.delivery.attempted, 1);
    assert_eq!(proxy.breaker().current_state(), CircuitState::Open);

    let mut stage = Decoder::new(Cursor::new("c".to_string()), "events");
    assert!(proxy.send_events(&mut stage).await.unwrap_err().is_circuit_open());
}

#[tokio::test]
async fn test_topics_listed_over_http() {
    let addr = start_gateway(Gateway::default()).await;
    let proxy = proxy(addr, None);

    assert_eq!(proxy.refresh_topics().await.unwrap(), 2);
    assert_eq!(proxy.topics(), vec!["events", "orders", "payments"]);
}
