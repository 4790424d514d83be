//! Exponential backoff for control-plane reconnection attempts.

use std::time::Duration;

use rand::Rng;

/// Parameters for [`ExponentialBackoff`]. The defaults follow the gRPC
/// connection-backoff doc: base 1s, multiplier 1.6, jitter 0.2, cap 120s.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
        }
    }
}

/// Produces successive delays growing exponentially up to the configured
/// cap, each randomized by the jitter factor.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    // Unjittered delay for the next attempt, in seconds. Kept as f64 so
    // repeated multiplication does not accumulate rounding error.
    next_secs: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_secs = config.base_delay.as_secs_f64();
        Self { config, next_secs }
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// schedule.
    pub fn next(&mut self) -> Duration {
        let unjittered = self.next_secs;
        self.next_secs = (unjittered * self.config.multiplier)
            .min(self.config.max_delay.as_secs_f64());
        let factor = 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        Duration::from_secs_f64(unjittered * factor)
    }

    /// Resets the schedule after a successful attempt.
    pub fn reset(&mut self) {
        self.next_secs = self.config.base_delay.as_secs_f64();
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
