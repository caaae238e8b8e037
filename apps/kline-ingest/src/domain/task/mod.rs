//! Scheduler Tasks
//!
//! Units of work produced by the scheduler and consumed exactly once by
//! the send/apply cycle.

use std::fmt;

use super::market::{Granularity, SeriesKey, Symbol};

/// A request for the bars of one series over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    /// Series being fetched.
    pub series: SeriesKey,
    /// Window start, unix seconds (inclusive).
    pub start: i64,
    /// Window end, unix seconds.
    pub end: i64,
}

impl FetchWindow {
    /// Create a window for `symbol`/`granularity`.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, granularity: Granularity, start: i64, end: i64) -> Self {
        Self {
            series: SeriesKey::new(symbol, granularity),
            start,
            end,
        }
    }

    /// Request id the exchange echoes back in its response.
    #[must_use]
    pub fn request_id(&self) -> String {
        self.series.to_string()
    }

    /// Window length in seconds.
    #[must_use]
    pub const fn span_secs(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.series, self.start, self.end)
    }
}

/// Scheduler task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Fetch one window of bars.
    FetchWindow(FetchWindow),
    /// Every granularity of a symbol has been requested during backfill.
    EndOfSymbol {
        /// Symbol whose backfill finished.
        symbol: Symbol,
    },
    /// No further tasks will be produced.
    Stop,
}

impl Task {
    /// Short task kind for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FetchWindow(_) => "fetch_window",
            Self::EndOfSymbol { .. } => "end_of_symbol",
            Self::Stop => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_window_request_id() {
        let window = FetchWindow::new("ethusdt", Granularity::OneDay, 100, 400);
        assert_eq!(window.request_id(), "ethusdt_1day");
        assert_eq!(window.span_secs(), 300);
        assert_eq!(window.to_string(), "ethusdt_1day[100..400)");
    }

    #[test]
    fn task_kinds() {
        let fetch = Task::FetchWindow(FetchWindow::new("a", Granularity::OneMinute, 0, 60));
        assert_eq!(fetch.kind(), "fetch_window");
        assert_eq!(
            Task::EndOfSymbol {
                symbol: "a".to_string()
            }
            .kind(),
            "end_of_symbol"
        );
        assert_eq!(Task::Stop.kind(), "stop");
    }
}
