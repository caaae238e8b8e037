//! Keepalive Tracking
//!
//! The exchange drives keepalives: it sends `{"ping": ts}` and expects the
//! timestamp echoed back. Each ping pushes the alive deadline to
//! `ts + grace`. The I/O task evaluates liveness on a fixed interval:
//!
//! - **Dead**: the deadline passed by more than `dead_after`. The session is
//!   closed and the connection reconnects.
//! - **Stale**: pings keep arriving but nothing else was dispatched for
//!   longer than `stale_after`. The handler is told so it can resubscribe.
//!
//! All times are unix epoch milliseconds.

use std::time::Duration;

use crate::infrastructure::config::StreamSettings;

/// Configuration for keepalive evaluation.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between liveness checks.
    pub check_interval: Duration,
    /// How far past a ping timestamp the session stays alive.
    pub grace: Duration,
    /// Tolerance past the alive deadline before the session is dead.
    pub dead_after: Duration,
    /// Silence (excluding pings) after which the session is stale.
    pub stale_after: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            grace: Duration::from_secs(10),
            dead_after: Duration::from_secs(1),
            stale_after: Duration::from_secs(5),
        }
    }
}

impl KeepaliveConfig {
    /// Build from the stream settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            check_interval: settings.health_check_interval,
            grace: settings.keepalive_grace,
            stale_after: settings.stale_after,
            ..Self::default()
        }
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Nothing to do.
    Healthy,
    /// Keepalives arrive but data does not.
    Stale {
        /// Milliseconds since the last dispatched message.
        silent_ms: i64,
    },
    /// The alive deadline passed.
    Dead {
        /// Milliseconds past the alive deadline.
        overdue_ms: i64,
    },
}

/// Per-session liveness timestamps.
#[derive(Debug, Clone)]
pub struct LivenessState {
    config: KeepaliveConfig,
    alive_deadline_ms: i64,
    last_update_ms: i64,
}

impl LivenessState {
    /// Start tracking a session opened at `now_ms`.
    #[must_use]
    pub fn new(config: KeepaliveConfig, now_ms: i64) -> Self {
        let alive_deadline_ms = now_ms.saturating_add(millis(config.grace));
        Self {
            config,
            alive_deadline_ms,
            last_update_ms: now_ms,
        }
    }

    /// Record a ping carrying the exchange timestamp.
    pub fn record_ping(&mut self, ts_ms: i64) {
        self.alive_deadline_ms = ts_ms.saturating_add(millis(self.config.grace));
    }

    /// Record a dispatched non-keepalive message.
    pub const fn record_update(&mut self, now_ms: i64) {
        self.last_update_ms = now_ms;
    }

    /// Current alive deadline.
    #[must_use]
    pub const fn alive_deadline_ms(&self) -> i64 {
        self.alive_deadline_ms
    }

    /// Time of the last dispatched message.
    #[must_use]
    pub const fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    /// Evaluate liveness at `now_ms`. Dead takes precedence over stale.
    #[must_use]
    pub fn evaluate(&self, now_ms: i64) -> HealthVerdict {
        let overdue_ms = now_ms.saturating_sub(self.alive_deadline_ms);
        if overdue_ms > millis(self.config.dead_after) {
            return HealthVerdict::Dead { overdue_ms };
        }

        let silent_ms = now_ms.saturating_sub(self.last_update_ms);
        if silent_ms > millis(self.config.stale_after) {
            return HealthVerdict::Stale { silent_ms };
        }

        HealthVerdict::Healthy
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
