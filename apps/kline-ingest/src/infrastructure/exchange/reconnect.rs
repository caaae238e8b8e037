//! Reconnection Policy
//!
//! Exponential backoff with symmetric jitter and a delay cap. The policy
//! is reset after every successful open, so a long-lived session that
//! drops starts again from the initial delay.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::StreamSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Build from the stream settings.
    #[must_use]
    pub const fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Backoff state across consecutive failed attempts.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no failed attempts.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt limit is hit.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(self.jitter(base))
    }

    /// Forget previous failures.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Check whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    /// `initial * multiplier^attempt`, capped at `max_delay`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        let secs = self.config.initial_delay.as_secs_f64() * factor;
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_delay
        }
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_factor;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.001))
    }
}
