//! Ingest Configuration Settings
//!
//! Configuration types for the kline ingester, loaded from environment
//! variables. Every value except `REDIS_URL` has a default; a value that is
//! present but does not parse is an error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{RelaySettings, SchedulerSettings};
use crate::domain::market::{Granularity, UnknownGranularity};

/// Streaming connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// WebSocket URL.
    pub url: String,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for writing one request frame.
    pub request_timeout: Duration,
    /// How long after a ping the session counts as alive.
    pub keepalive_grace: Duration,
    /// Interval between liveness checks.
    pub health_check_interval: Duration,
    /// Silence after which the session is stale.
    pub stale_after: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter as a fraction of the reconnection delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound frame queue.
    pub outbound_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.huobi.pro/ws".to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            keepalive_grace: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(5),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 0,
            outbound_capacity: 256,
        }
    }
}

/// Storage locations.
#[derive(Clone)]
pub struct StoreSettings {
    /// Redis URL for cursors, the symbol registry and tick publishing.
    pub redis_url: String,
    /// SQLite database file for bars.
    pub sqlite_path: PathBuf,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("redis_url", &"[REDACTED]")
            .field("sqlite_path", &self.sqlite_path)
            .finish()
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingester configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Streaming connection settings.
    pub stream: StreamSettings,
    /// Scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Maximum outstanding exchange requests.
    pub max_in_flight: usize,
    /// Storage locations.
    pub store: StoreSettings,
    /// Tick relay settings.
    pub relay: RelaySettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Directory for rotated log files.
    pub log_dir: PathBuf,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `REDIS_URL` is missing or a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `REDIS_URL` is missing or a value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let redis_url = env
            .get("REDIS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;
        if redis_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("REDIS_URL".to_string()));
        }

        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            url: env.get("KLINE_WS_URL").unwrap_or(defaults.url),
            connect_timeout: env.secs("KLINE_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            request_timeout: env.secs("KLINE_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            keepalive_grace: env.secs("KLINE_KEEPALIVE_GRACE_SECS", defaults.keepalive_grace)?,
            health_check_interval: env.secs(
                "KLINE_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            stale_after: env.secs("KLINE_STALE_AFTER_SECS", defaults.stale_after)?,
            reconnect_delay_initial: env.millis(
                "KLINE_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "KLINE_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "KLINE_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            )?,
            reconnect_jitter: env.parse("KLINE_RECONNECT_JITTER", defaults.reconnect_jitter)?,
            max_reconnect_attempts: env.parse(
                "KLINE_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            outbound_capacity: env.parse("KLINE_OUTBOUND_CAPACITY", defaults.outbound_capacity)?,
        };

        let scheduler_defaults = SchedulerSettings::default();
        let granularities = match env.get("KLINE_GRANULARITIES") {
            Some(list) => {
                let parsed = Granularity::parse_list(&list)?;
                if parsed.is_empty() {
                    return Err(ConfigError::EmptyValue("KLINE_GRANULARITIES".to_string()));
                }
                parsed
            }
            None => scheduler_defaults.granularities,
        };
        let scheduler = SchedulerSettings {
            granularities,
            runtime_cadence: env.secs(
                "KLINE_RUNTIME_CADENCE_SECS",
                scheduler_defaults.runtime_cadence,
            )?,
            reconnect_wait: scheduler_defaults.reconnect_wait,
            request_expiry: env.secs(
                "KLINE_REQUEST_EXPIRY_SECS",
                scheduler_defaults.request_expiry,
            )?,
        };

        let max_in_flight: usize = env.parse("KLINE_MAX_IN_FLIGHT", 2)?;
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KLINE_MAX_IN_FLIGHT".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let relay_defaults = RelaySettings::default();
        let relay = RelaySettings {
            channel: env.get("KLINE_TICK_CHANNEL").unwrap_or(relay_defaults.channel),
            resubscribe_interval: env.secs(
                "KLINE_RESUBSCRIBE_INTERVAL_SECS",
                relay_defaults.resubscribe_interval,
            )?,
            queue_capacity: relay_defaults.queue_capacity,
        };

        let store = StoreSettings {
            redis_url,
            sqlite_path: env
                .get("KLINE_SQLITE_PATH")
                .map_or_else(|| PathBuf::from("data/klines.db"), PathBuf::from),
        };

        let server = ServerSettings {
            health_port: env.parse("KLINE_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        Ok(Self {
            stream,
            scheduler,
            max_in_flight,
            store,
            relay,
            server,
            log_dir: env
                .get("KLINE_LOG_DIR")
                .map_or_else(|| PathBuf::from("logs"), PathBuf::from),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },
    /// A granularity label is not supported.
    #[error(transparent)]
    Granularity(#[from] UnknownGranularity),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }
}
