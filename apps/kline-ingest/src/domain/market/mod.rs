//! Market Data Types
//!
//! Symbols, bar granularities, series keys and the bar record itself.
//! These types carry the exchange's wire labels but no I/O.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum number of bars the exchange returns for a single fetch request.
pub const MAX_BARS_PER_REQUEST: i64 = 300;

/// Trading symbol identifier (e.g. `btcusdt`).
pub type Symbol = String;

// =============================================================================
// Symbol State
// =============================================================================

/// Enablement state of a symbol in the registry.
///
/// Stored as the integers `0`, `1` and `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolState {
    /// Symbol is not ingested.
    #[default]
    Disabled,
    /// Symbol is waiting for its historical backfill.
    PendingInit,
    /// Backfill finished; the symbol takes part in runtime ingestion.
    Active,
}

impl SymbolState {
    /// Integer code used by the registry.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Disabled => 0,
            Self::PendingInit => 1,
            Self::Active => 2,
        }
    }

    /// Decode a registry integer. Unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Disabled),
            1 => Some(Self::PendingInit),
            2 => Some(Self::Active),
            _ => None,
        }
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::PendingInit => "pending_init",
            Self::Active => "active",
        }
    }
}

// =============================================================================
// Granularity
// =============================================================================

/// Bar width selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    /// One-minute bars.
    #[serde(rename = "1min")]
    OneMinute,
    /// Five-minute bars.
    #[serde(rename = "5min")]
    FiveMinutes,
    /// Fifteen-minute bars.
    #[serde(rename = "15min")]
    FifteenMinutes,
    /// Thirty-minute bars.
    #[serde(rename = "30min")]
    ThirtyMinutes,
    /// Hourly bars.
    #[serde(rename = "60min")]
    SixtyMinutes,
    /// Daily bars.
    #[serde(rename = "1day")]
    OneDay,
    /// Weekly bars.
    #[serde(rename = "1week")]
    OneWeek,
}

impl Granularity {
    /// Every supported granularity, finest first.
    pub const ALL: [Self; 7] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::SixtyMinutes,
        Self::OneDay,
        Self::OneWeek,
    ];

    /// Wire label used in topics, request ids and cursor field names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1min",
            Self::FiveMinutes => "5min",
            Self::FifteenMinutes => "15min",
            Self::ThirtyMinutes => "30min",
            Self::SixtyMinutes => "60min",
            Self::OneDay => "1day",
            Self::OneWeek => "1week",
        }
    }

    /// Bucket width in seconds.
    #[must_use]
    pub const fn bucket_secs(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::ThirtyMinutes => 1_800,
            Self::SixtyMinutes => 3_600,
            Self::OneDay => 86_400,
            Self::OneWeek => 604_800,
        }
    }

    /// Largest span a single fetch can cover.
    #[must_use]
    pub const fn max_window_secs(self) -> i64 {
        self.bucket_secs() * MAX_BARS_PER_REQUEST
    }

    /// Parse a comma separated list such as `1min,5min,1day`.
    ///
    /// # Errors
    ///
    /// Returns the first label that is not a known granularity.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, UnknownGranularity> {
        let mut out = Vec::new();
        for label in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let granularity = label.parse()?;
            if !out.contains(&granularity) {
                out.push(granularity);
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownGranularity(s.to_string()))
    }
}

/// A granularity label that is not part of the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown granularity: {0}")]
pub struct UnknownGranularity(pub String);

// =============================================================================
// Series Key
// =============================================================================

/// One (symbol, granularity) time series.
///
/// Rendered as `<symbol>_<granularity>`, which is both the storage
/// collection name and the exchange request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Symbol of the series.
    pub symbol: Symbol,
    /// Bar width of the series.
    pub granularity: Granularity,
}

impl SeriesKey {
    /// Create a new series key.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, granularity: Granularity) -> Self {
        Self {
            symbol: symbol.into(),
            granularity,
        }
    }

    /// Exchange topic for this series.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("market.{}.kline.{}", self.symbol, self.granularity)
    }

    /// Name of the cursor field in the symbol's hash.
    #[must_use]
    pub fn cursor_field(&self) -> String {
        format!("cur_time_{}", self.granularity)
    }

    /// Parse a `<symbol>_<granularity>` id.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesKeyError`] when the id has no separator or the
    /// granularity suffix is unknown.
    pub fn parse(id: &str) -> Result<Self, SeriesKeyError> {
        let (symbol, label) = id
            .rsplit_once('_')
            .ok_or_else(|| SeriesKeyError::Malformed(id.to_string()))?;
        if symbol.is_empty() {
            return Err(SeriesKeyError::Malformed(id.to_string()));
        }
        let granularity = label.parse()?;
        Ok(Self::new(symbol, granularity))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.symbol, self.granularity)
    }
}

/// Errors from parsing a series id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeriesKeyError {
    /// The id is not of the form `<symbol>_<granularity>`.
    #[error("malformed series id: {0}")]
    Malformed(String),
    /// The granularity suffix is not supported.
    #[error(transparent)]
    Granularity(#[from] UnknownGranularity),
}

// =============================================================================
// Bar
// =============================================================================

/// One fixed-interval OHLCV bar, keyed by its bucket start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bucket start, unix seconds. Unique within a series.
    pub id: i64,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
    /// Traded base-currency amount.
    #[serde(default)]
    pub amount: Decimal,
    /// Traded quote-currency volume.
    #[serde(default)]
    pub vol: Decimal,
    /// Number of trades.
    #[serde(default)]
    pub count: u64,
}
