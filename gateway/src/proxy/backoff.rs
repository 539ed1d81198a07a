//! Exponential backoff with jitter for the circuit breaker
//!
//! The breaker waits `initial_delay * multiplier^(trip - 1)` before letting a
//! probe through, capped at `max_delay` and spread by `jitter_factor`.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FALLBACK_SEED: u64 = 0x853c_49e6_748f_ea9b;

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Shared jitter source, seeded from the clock
struct JitterSource(AtomicU64);

impl JitterSource {
    fn seeded() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self(AtomicU64::new(if nanos == 0 { FALLBACK_SEED } else { nanos }))
    }

    fn next_u64(&self) -> u64 {
        // the closure never returns None, so both arms carry the old state
        let prev = match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| Some(xorshift(x)))
        {
            Ok(x) | Err(x) => x,
        };
        xorshift(prev)
    }

    /// Uniform sample in `[0.0, 1.0]`
    fn sample(&self) -> f64 {
        self.next_u64() as f64 / u64::MAX as f64
    }
}

static JITTER: LazyLock<JitterSource> = LazyLock::new(JitterSource::seeded);

/// Backoff between circuit-breaker probes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Wait after the first trip
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any wait
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth per consecutive trip
    pub multiplier: f64,
    /// Randomizes each wait by +/- this fraction (0.0 disables jitter)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Backoff without jitter, for deterministic timing
    pub fn fixed(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Wait after trip number `trip` (1-based; 0 waits for nothing)
    pub fn delay_for_trip(&self, trip: u32) -> Duration {
        self.delay_for_trip_with_jitter(trip, JITTER.sample())
    }

    /// Wait with an explicit jitter sample in `[0.0, 1.0]`
    ///
    /// A sample of 0.5 yields the un-jittered delay.
    pub fn delay_for_trip_with_jitter(&self, trip: u32, jitter: f64) -> Duration {
        if trip == 0 {
            return Duration::ZERO;
        }

        let exponent = (trip - 1).min(i32::MAX as u32) as i32;
        let base_us = self.initial_delay.as_micros() as f64 * self.multiplier.powi(exponent);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        let spread = base_us * self.jitter_factor.clamp(0.0, 1.0);
        let offset = (jitter.clamp(0.0, 1.0) * 2.0 - 1.0) * spread;
        let final_us = (base_us + offset).clamp(1.0, self.max_delay.as_micros().max(1) as f64);

        Duration::from_micros(final_us as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_zero_is_zero() {
        assert_eq!(BackoffConfig::default().delay_for_trip(0), Duration::ZERO);
    }

    #[test]
    fn test_doubling_from_initial() {
        let config = BackoffConfig::fixed(Duration::from_millis(500), Duration::from_secs(30));

        assert_eq!(config.delay_for_trip(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_trip(2), Duration::from_secs(1));
        assert_eq!(config.delay_for_trip(3), Duration::from_secs(2));
        assert_eq!(config.delay_for_trip(4), Duration::from_secs(4));
    }

    #[test]
    fn test_caps_at_max() {
        let config = BackoffConfig::fixed(Duration::from_millis(500), Duration::from_secs(30));

        // 500ms * 2^7 = 64s
        assert_eq!(config.delay_for_trip(8), Duration::from_secs(30));
        assert_eq!(config.delay_for_trip(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_range() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.5,
        };

        assert_eq!(
            config.delay_for_trip_with_jitter(1, 0.0),
            Duration::from_millis(50)
        );
        assert_eq!(
            config.delay_for_trip_with_jitter(1, 0.5),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.delay_for_trip_with_jitter(1, 1.0),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let config = BackoffConfig {
            jitter_factor: 1.0,
            ..BackoffConfig::fixed(Duration::from_millis(100), Duration::from_millis(150))
        };
        assert_eq!(
            config.delay_for_trip_with_jitter(3, 1.0),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_jitter_source_does_not_repeat() {
        let source = JitterSource::seeded();
        let seen: std::collections::HashSet<u64> = (0..100).map(|_| source.next_u64()).collect();
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_samples_stay_in_unit_range() {
        for _ in 0..1000 {
            let v = JITTER.sample();
            assert!((0.0..=1.0).contains(&v), "{v} out of range");
        }
    }
}
