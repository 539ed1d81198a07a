//! Prometheus metrics for the proxy
//!
//! Everything registers into a caller-owned [`Registry`]; the runtime passes
//! the same registry to the `/metrics` handler.

use crate::error::{ProxyError, Result};
use crate::proxy::CircuitState;
use prometheus::{
    Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};

/// Proxy and transport metrics
pub struct ProxyMetrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Transport counters
    // ─────────────────────────────────────────────────────────────────────────
    /// Records forwarded (by transport)
    pub events_sent: IntCounterVec,

    /// Records acknowledged by the broker gateway (by transport)
    pub events_confirmed: IntCounterVec,

    /// Records rerouted by the JSON validation filter (by original topic)
    pub events_filtered: IntCounterVec,

    /// Duration of one send_events call
    pub send_duration_seconds: HistogramVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────
    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: Gauge,

    /// Sends rejected locally by the open circuit
    pub circuit_breaker_rejected: IntCounter,

    /// Size of the last fetched dynamic topic list
    pub dynamic_topics: IntGauge,
}

impl ProxyMetrics {
    /// Create and register all metrics
    pub fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            events_sent: register_int_counter_vec_with_registry!(
                "edgeproxy_events_sent_total",
                "Records forwarded to the broker gateway",
                &["transport"],
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("events_sent: {e}")))?,

            events_confirmed: register_int_counter_vec_with_registry!(
                "edgeproxy_events_confirmed_total",
                "Records acknowledged by the broker gateway",
                &["transport"],
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("events_confirmed: {e}")))?,

            events_filtered: register_int_counter_vec_with_registry!(
                "edgeproxy_events_filtered_total",
                "Records rerouted to the invalid messages topic",
                &["topic"],
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("events_filtered: {e}")))?,

            send_duration_seconds: register_histogram_vec_with_registry!(
                "edgeproxy_send_duration_seconds",
                "Time spent in one send_events call",
                &["transport"],
                // Buckets: 1ms to 30s
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0],
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("send_duration_seconds: {e}")))?,

            circuit_breaker_state: register_gauge_with_registry!(
                "edgeproxy_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("circuit_breaker_state: {e}")))?,

            circuit_breaker_rejected: register_int_counter_with_registry!(
                "edgeproxy_circuit_breaker_rejected_total",
                "Sends rejected while the circuit was open",
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("circuit_breaker_rejected: {e}")))?,

            dynamic_topics: register_int_gauge_with_registry!(
                "edgeproxy_dynamic_topics",
                "Topics in the last list fetched from the broker gateway",
                registry
            )
            .map_err(|e| ProxyError::Metrics(format!("dynamic_topics: {e}")))?,
        })
    }

    /// Record forwarded records
    pub fn record_sent(&self, transport: &str, count: u64) {
        if count > 0 {
            self.events_sent
                .with_label_values(&[transport])
                .inc_by(count);
        }
    }

    /// Record acknowledged records
    pub fn record_confirmed(&self, transport: &str, count: u64) {
        if count > 0 {
            self.events_confirmed
                .with_label_values(&[transport])
                .inc_by(count);
        }
    }

    /// Record one rerouted record
    pub fn record_filtered(&self, topic: &str) {
        self.events_filtered.with_label_values(&[topic]).inc();
    }

    /// Record send duration for a transport
    pub fn record_send_duration(&self, transport: &str, seconds: f64) {
        self.send_duration_seconds
            .with_label_values(&[transport])
            .observe(seconds);
    }

    /// Set circuit breaker state
    pub fn set_circuit_state(&self, state: CircuitState) {
        self.circuit_breaker_state.set(state.as_metric_value());
    }

    /// Record a send rejected by the open circuit
    pub fn record_circuit_rejected(&self) {
        self.circuit_breaker_rejected.inc();
    }

    /// Update the dynamic topic count
    pub fn set_dynamic_topics(&self, count: usize) {
        self.dynamic_topics.set(count as i64);
    }
}

/// Render all metrics of a registry in Prometheus text format
pub fn gather(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| ProxyError::Metrics(format!("encode: {e}")))?;
    String::from_utf8(buffer).map_err(|e| ProxyError::Metrics(format!("encode: {e}")))
}
