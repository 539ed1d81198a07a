//! Circuit breaker guarding the broker transport
//!
//! Counts consecutive transport failures. At the threshold the circuit opens
//! for a backoff interval; after it elapses one probe is let through. A
//! successful probe closes the circuit, a failed one re-opens it with the
//! next, longer interval.
//!
//! Admission hands out a [`Permit`]. Only the permit that opened the
//! half-open window can close or re-open the circuit; results of calls
//! admitted earlier only touch the failure count. A probe permit dropped
//! without a result gives the probe back.

use super::backoff::BackoffConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Admission state of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through
    Closed,
    /// Requests are rejected locally
    Open,
    /// One probe request is allowed through
    HalfOpen,
}

impl CircuitState {
    /// Prometheus gauge value (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }

    /// Lowercase name for logs and health output
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Trip threshold and probe backoff
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Wait between opening and the next probe
    pub backoff: BackoffConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Trips since the circuit was last closed; drives the backoff exponent
    trips: u32,
    current_interval: Duration,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trips: 0,
            current_interval: Duration::ZERO,
            opened_at: None,
        }
    }

    fn interval_elapsed(&self) -> bool {
        self.opened_at
            .map_or(true, |at| at.elapsed() >= self.current_interval)
    }
}

/// Admission gate in front of the transport
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    /// Number of trips (closed or half-open to open)
    open_count: AtomicU64,
    /// Sends refused while open or while a probe is in flight
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker; a zero threshold is treated as 1
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            ..config
        };
        Self {
            config,
            state: RwLock::new(BreakerState::new()),
            open_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Current circuit state
    pub fn current_state(&self) -> CircuitState {
        self.state.read().state
    }

    /// True when a call would currently be admitted (does not change state)
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state.interval_elapsed(),
            CircuitState::HalfOpen => false,
        }
    }

    /// Admit a call, moving Open to HalfOpen once the interval elapsed
    ///
    /// In HalfOpen no further permit is issued until the probe reports back
    /// or is dropped.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut state = self.state.write();
        let current = state.state;

        match current {
            CircuitState::Closed => Some(Permit::new(self, false)),

            CircuitState::Open if state.interval_elapsed() => {
                state.state = CircuitState::HalfOpen;
                tracing::info!(
                    interval_ms = state.current_interval.as_millis() as u64,
                    "circuit breaker half-open - probing broker"
                );
                Some(Permit::new(self, true))
            }

            CircuitState::Open | CircuitState::HalfOpen => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a call that did not fail at the transport
    ///
    /// Resets the failure count. The state only changes when `probe` is set
    /// and the circuit is half-open.
    fn record_success(&self, probe: bool) {
        let mut state = self.state.write();
        state.consecutive_failures = 0;

        if probe && state.state == CircuitState::HalfOpen {
            tracing::info!(
                trips = state.trips,
                "circuit breaker closed - broker recovered"
            );
            state.state = CircuitState::Closed;
            state.trips = 0;
            state.current_interval = Duration::ZERO;
            state.opened_at = None;
        }
    }

    /// Record a transport failure
    fn record_failure(&self, probe: bool) {
        let mut state = self.state.write();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let current = state.state;

        match current {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut state);
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        interval_ms = state.current_interval.as_millis() as u64,
                        "broker circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                self.trip(&mut state);
                tracing::warn!(
                    trips = state.trips,
                    interval_ms = state.current_interval.as_millis() as u64,
                    "broker probe failed, circuit open again"
                );
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                // late result of a call admitted before the trip
            }
        }
    }

    /// Probe dropped without a result; the next caller may probe
    fn release_probe(&self) {
        let mut state = self.state.write();
        if state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Open;
            tracing::debug!("broker probe abandoned, circuit back to open");
        }
    }

    fn trip(&self, state: &mut BreakerState) {
        state.trips = state.trips.saturating_add(1);
        state.current_interval = self.config.backoff.delay_for_trip(state.trips);
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Consecutive failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    /// Interval of the current (or last) open period
    pub fn current_interval(&self) -> Duration {
        self.state.read().current_interval
    }

    /// Failure threshold in effect
    pub fn failure_threshold(&self) -> u32 {
        self.config.failure_threshold
    }

    /// Times the circuit has opened
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Calls rejected while open or while a probe is in flight
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }
}

/// Admission ticket for one call through the breaker
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`].
#[must_use = "a permit must report the call outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    /// True for the single half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The call did not fail at the transport
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.probe);
    }

    /// The call failed at the transport
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.release_probe();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
