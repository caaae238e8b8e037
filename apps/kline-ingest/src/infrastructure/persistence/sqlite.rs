//! SQLite bar store.
//!
//! All series share one `bars` table keyed by `(series, id)`. Inserts are
//! plain `INSERT`s so that a repeated bar surfaces as a unique violation,
//! which is reported as [`InsertOutcome::Duplicate`].

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::application::ports::{BarStore, InsertOutcome, StoreError};
use crate::domain::market::{Bar, SeriesKey};

const CREATE_BARS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS bars (
    series TEXT NOT NULL,
    id INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    amount TEXT NOT NULL,
    vol TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (series, id)
)";

type BarRow = (i64, String, String, String, String, String, String, i64);

/// [`BarStore`] backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteBarStore {
    pool: SqlitePool,
}

impl SqliteBarStore {
    /// Open (creating if missing) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the file cannot be opened and
    /// [`StoreError::Query`] if the schema cannot be created.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection {
                message: e.to_string(),
            })?;

        sqlx::query(CREATE_BARS_TABLE)
            .execute(&pool)
            .await
            .map_err(query_error)?;

        tracing::info!(path = %path.display(), "Bar store ready");
        Ok(Self { pool })
    }

    /// Number of bars stored for a series.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the count fails.
    pub async fn count(&self, series: &SeriesKey) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bars WHERE series = ?")
            .bind(series.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(count)
    }
}

#[async_trait]
impl BarStore for SqliteBarStore {
    async fn insert(&self, series: &SeriesKey, bar: &Bar) -> Result<InsertOutcome, StoreError> {
        let count = i64::try_from(bar.count).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "INSERT INTO bars (series, id, open, high, low, close, amount, vol, count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(series.to_string())
        .bind(bar.id)
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .bind(bar.amount.to_string())
        .bind(bar.vol.to_string())
        .bind(count)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn find_one(&self, series: &SeriesKey, id: i64) -> Result<Option<Bar>, StoreError> {
        let row: Option<BarRow> = sqlx::query_as(
            "SELECT id, open, high, low, close, amount, vol, count \
             FROM bars WHERE series = ? AND id = ?",
        )
        .bind(series.to_string())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(row_to_bar).transpose()
    }
}

fn row_to_bar(row: BarRow) -> Result<Bar, StoreError> {
    let (id, open, high, low, close, amount, vol, count) = row;
    Ok(Bar {
        id,
        open: parse_decimal(&open)?,
        high: parse_decimal(&high)?,
        low: parse_decimal(&low)?,
        close: parse_decimal(&close)?,
        amount: parse_decimal(&amount)?,
        vol: parse_decimal(&vol)?,
        count: u64::try_from(count).unwrap_or_default(),
    })
}

fn parse_decimal(value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|e| StoreError::Corrupt {
        message: format!("bad decimal {value:?}: {e}"),
    })
}

fn query_error(e: sqlx::Error) -> StoreError {
    StoreError::Query {
        message: e.to_string(),
    }
}
