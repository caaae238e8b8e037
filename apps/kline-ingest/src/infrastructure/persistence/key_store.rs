//! Redis key store and publisher.
//!
//! Layout:
//! - `symbols`: list of symbols in registry order
//! - `<symbol>`: hash with `enabled` (0/1/2) and one `cur_time_<granularity>`
//!   field per series cursor
//! - ticks are published verbatim on a pub/sub channel

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::application::ports::{
    CursorStore, PublishError, StoreError, SymbolRegistry, TickPublisher,
};
use crate::domain::market::{SeriesKey, Symbol, SymbolState};

/// Registry list key.
pub const SYMBOLS_KEY: &str = "symbols";

/// Hash field holding a symbol's enablement state.
pub const ENABLED_FIELD: &str = "enabled";

/// Redis-backed [`CursorStore`], [`SymbolRegistry`] and [`TickPublisher`].
///
/// The connection manager reconnects on its own; clones share it.
#[derive(Clone)]
pub struct RedisKeyStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyStore").finish_non_exhaustive()
    }
}

impl RedisKeyStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(connection_error)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(connection_error)?;
        tracing::info!("Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CursorStore for RedisKeyStore {
    async fn cursor(&self, series: &SeriesKey) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(&series.symbol, series.cursor_field())
            .await
            .map_err(query_error)
    }

    async fn set_cursor(&self, series: &SeriesKey, value: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&series.symbol, series.cursor_field(), value)
            .await
            .map_err(query_error)
    }
}

#[async_trait]
impl SymbolRegistry for RedisKeyStore {
    async fn symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        let mut conn = self.conn.clone();
        conn.lrange(SYMBOLS_KEY, 0, -1).await.map_err(query_error)
    }

    async fn state(&self, symbol: &str) -> Result<SymbolState, StoreError> {
        let mut conn = self.conn.clone();
        let code: Option<i64> = conn
            .hget(symbol, ENABLED_FIELD)
            .await
            .map_err(query_error)?;
        Ok(match code {
            Some(code) => SymbolState::from_code(code).unwrap_or_else(|| {
                tracing::warn!(symbol, code, "Unknown enablement code, treating as disabled");
                SymbolState::Disabled
            }),
            None => SymbolState::Disabled,
        })
    }

    async fn set_state(&self, symbol: &str, state: SymbolState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(symbol, ENABLED_FIELD, state.code())
            .await
            .map_err(query_error)
    }
}

#[async_trait]
impl TickPublisher for RedisKeyStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| PublishError::PublishFailed {
                message: e.to_string(),
            })
    }
}

fn connection_error(e: redis::RedisError) -> StoreError {
    StoreError::Connection {
        message: e.to_string(),
    }
}

fn query_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        connection_error(e)
    } else {
        StoreError::Query {
            message: e.to_string(),
        }
    }
}
