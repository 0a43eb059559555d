//! Reconnect delay policy.

use std::time::Duration;

/// Baseline delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Floor applied to every computed delay, so reconnects can never storm.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Controls how long the connection manager waits before reconnecting.
///
/// There is deliberately no attempt limit: the manager retries until it
/// is stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap).
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt. Values below 1 are treated as 1.
    pub multiplier: f64,
    /// Extra delay as a fraction of the capped delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::constant(DEFAULT_RECONNECT_DELAY)
    }
}

impl BackoffPolicy {
    /// Same delay before every attempt.
    #[must_use]
    pub const fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Doubling delay, capped at `max_delay`.
    #[must_use]
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Add jitter on top of the computed delay.
    #[must_use]
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Compute the delay for the given attempt number (0-indexed).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(64) as i32;
        let delay_ms = base_ms * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = if delay_ms.is_finite() {
            delay_ms.min(max_ms)
        } else {
            max_ms
        };

        let jitter_ms = capped_ms * self.jitter * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter_ms) as u64).max(MIN_RECONNECT_DELAY)
    }
}

/// Deterministic fraction in `[0, 1)` derived from the attempt number.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2_654_435_761);
    f64::from(hash) / (f64::from(u32::MAX) + 1.0)
}
