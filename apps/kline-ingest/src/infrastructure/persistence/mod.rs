//! Persistence Adapters
//!
//! Implementations of the storage ports: SQLite for bars, Redis for
//! cursors/registry/publish, and in-memory variants for tests.

mod in_memory;
mod key_store;
mod sqlite;

pub use in_memory::{InMemoryBarStore, InMemoryKeyStore};
pub use key_store::{ENABLED_FIELD, RedisKeyStore, SYMBOLS_KEY};
pub use sqlite::SqliteBarStore;
