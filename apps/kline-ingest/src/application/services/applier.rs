//! Response Applier
//!
//! Turns a fetch response into ordered, deduplicated bar writes and
//! advances the series cursor behind them. The matching in-flight entry
//! is released only after the whole batch has been processed.
//!
//! A window the exchange rejected, or one whose batch stopped on a storage
//! error, goes back to admission control for another attempt. The cursor
//! only covers bars that were stored, so the retry resumes where the batch
//! stopped.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::application::ports::{BarStore, CursorStore, InsertOutcome, StoreError};
use crate::application::services::admission::AdmissionControl;
use crate::domain::market::SeriesKey;
use crate::domain::protocol::{FetchResponse, ResponseStatus};
use crate::infrastructure::metrics;

/// What applying one response did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every bar was stored or already present.
    Applied {
        /// Newly stored bars.
        inserted: usize,
        /// Bars that were already stored.
        duplicates: usize,
        /// Cursor after the batch.
        cursor: Option<i64>,
    },
    /// A storage error stopped the batch; the cursor covers the bars before it.
    Partial {
        /// Newly stored bars before the failure.
        inserted: usize,
        /// Duplicate bars before the failure.
        duplicates: usize,
        /// Cursor after the last good bar.
        cursor: Option<i64>,
        /// The storage error.
        error: StoreError,
    },
    /// The response carried no bars.
    Empty,
    /// The exchange reported an error.
    Rejected {
        /// Exchange error code.
        code: String,
        /// Exchange error message.
        message: String,
    },
    /// The response id does not name a series.
    InvalidId,
    /// A bar id leaves no room for the cursor after it.
    InvalidBar {
        /// Offending bar id.
        bar_id: i64,
    },
}

impl ApplyOutcome {
    /// Metric label for the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Partial { .. } => "partial",
            Self::Empty => "empty",
            Self::Rejected { .. } => "rejected",
            Self::InvalidId => "invalid_id",
            Self::InvalidBar { .. } => "invalid_bar",
        }
    }

    /// Check whether the window should be fetched again.
    #[must_use]
    pub const fn needs_retry(&self) -> bool {
        matches!(self, Self::Partial { .. } | Self::Rejected { .. })
    }
}

/// Applies fetch responses to the bar and cursor stores.
pub struct ResponseApplier {
    bars: Arc<dyn BarStore>,
    cursors: Arc<dyn CursorStore>,
    admission: Arc<AdmissionControl>,
}

impl ResponseApplier {
    /// Create a new applier.
    #[must_use]
    pub fn new(
        bars: Arc<dyn BarStore>,
        cursors: Arc<dyn CursorStore>,
        admission: Arc<AdmissionControl>,
    ) -> Self {
        Self {
            bars,
            cursors,
            admission,
        }
    }

    /// Apply responses from `rx` until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FetchResponse>) {
        while let Some(response) = rx.recv().await {
            self.apply(response).await;
        }
        tracing::debug!("Response channel closed, applier stopping");
    }

    /// Apply one response and release its permit.
    pub async fn apply(&self, response: FetchResponse) -> ApplyOutcome {
        let started = Instant::now();
        let in_flight = self.admission.complete(&response.id);
        if in_flight.is_none() {
            tracing::warn!(id = %response.id, "Response without a matching in-flight request");
        }

        let id = response.id.clone();
        let outcome = self.apply_batch(response).await;
        match in_flight {
            Some(entry) if outcome.needs_retry() => {
                let window = entry.window().clone();
                if self.admission.retry(entry) {
                    tracing::info!(window = %window, outcome = outcome.label(), "Window requeued");
                }
            }
            entry => drop(entry),
        }

        metrics::record_response(outcome.label());
        metrics::record_apply_duration(started.elapsed());
        match &outcome {
            ApplyOutcome::Applied {
                inserted,
                duplicates,
                cursor,
            } => {
                metrics::record_bars(*inserted, *duplicates);
                tracing::debug!(id = %id, inserted, duplicates, cursor, "Response applied");
            }
            ApplyOutcome::Partial {
                inserted,
                duplicates,
                ..
            } => metrics::record_bars(*inserted, *duplicates),
            _ => {}
        }
        outcome
    }

    async fn apply_batch(&self, response: FetchResponse) -> ApplyOutcome {
        if let ResponseStatus::Error { code, message } = response.status {
            tracing::warn!(id = %response.id, code = %code, message = %message, "Exchange rejected request");
            return ApplyOutcome::Rejected { code, message };
        }

        if response.bars.is_empty() {
            return ApplyOutcome::Empty;
        }

        let series = match SeriesKey::parse(&response.id) {
            Ok(series) => series,
            Err(e) => {
                tracing::warn!(id = %response.id, error = %e, "Response id does not name a series");
                return ApplyOutcome::InvalidId;
            }
        };

        let mut bars = response.bars;
        bars.sort_by_key(|bar| bar.id);
        if let Some(last) = bars.last()
            && last.id.checked_add(1).is_none()
        {
            tracing::warn!(series = %series, bar_id = last.id, "Bar id out of range");
            return ApplyOutcome::InvalidBar { bar_id: last.id };
        }

        let mut cursor = match self.cursors.cursor(&series).await {
            Ok(cursor) => cursor,
            Err(error) => {
                tracing::error!(series = %series, error = %error, "Failed to read cursor");
                return ApplyOutcome::Partial {
                    inserted: 0,
                    duplicates: 0,
                    cursor: None,
                    error,
                };
            }
        };

        let mut inserted = 0;
        let mut duplicates = 0;
        for bar in &bars {
            match self.bars.insert(&series, bar).await {
                Ok(InsertOutcome::Inserted) => inserted += 1,
                Ok(InsertOutcome::Duplicate) => duplicates += 1,
                Err(error) => {
                    tracing::error!(series = %series, bar_id = bar.id, error = %error, "Bar insert failed");
                    return ApplyOutcome::Partial {
                        inserted,
                        duplicates,
                        cursor,
                        error,
                    };
                }
            }

            // Bounded by the range check on the last bar.
            let next = bar.id.saturating_add(1);
            if cursor.is_none_or(|current| next > current) {
                if let Err(error) = self.cursors.set_cursor(&series, next).await {
                    tracing::error!(series = %series, cursor = next, error = %error, "Cursor update failed");
                    return ApplyOutcome::Partial {
                        inserted,
                        duplicates,
                        cursor,
                        error,
                    };
                }
                cursor = Some(next);
            }
        }

        ApplyOutcome::Applied {
            inserted,
            duplicates,
            cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Bar, Granularity};
    use crate::domain::task::FetchWindow;
    use crate::infrastructure::persistence::{InMemoryBarStore, InMemoryKeyStore};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn bar(id: i64) -> Bar {
        Bar {
            id,
            open: Decimal::ONE,
            high: Decimal::TWO,
            low: Decimal::ONE,
            close: Decimal::TWO,
            amount: Decimal::TEN,
            vol: Decimal::TEN,
            count: 1,
        }
    }

    struct Fixture {
        bars: Arc<InMemoryBarStore>,
        keys: Arc<InMemoryKeyStore>,
        admission: Arc<AdmissionControl>,
        applier: ResponseApplier,
    }

    fn fixture() -> Fixture {
        let bars = Arc::new(InMemoryBarStore::new());
        let keys = Arc::new(InMemoryKeyStore::new());
        let admission = Arc::new(AdmissionControl::new(2));
        let applier = ResponseApplier::new(
            Arc::clone(&bars) as Arc<dyn BarStore>,
            Arc::clone(&keys) as Arc<dyn CursorStore>,
            Arc::clone(&admission),
        );
        Fixture {
            bars,
            keys,
            admission,
            applier,
        }
    }

    fn series() -> SeriesKey {
        SeriesKey::new("btcusdt", Granularity::OneMinute)
    }

    #[tokio::test]
    async fn bars_are_stored_in_ascending_order() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);

        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt_1min", vec![bar(50), bar(10), bar(30)]))
            .await;

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                inserted: 3,
                duplicates: 0,
                cursor: Some(51)
            }
        );
        assert_eq!(fx.bars.insertion_order(&series()), vec![10, 30, 50]);
        assert_eq!(fx.keys.cursor_value(&series()), Some(51));
    }

    #[tokio::test]
    async fn applying_the_same_batch_twice_is_idempotent() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);
        let response = FetchResponse::ok("btcusdt_1min", vec![bar(60), bar(120)]);

        fx.applier.apply(response.clone()).await;
        let second = fx.applier.apply(response).await;

        assert_eq!(
            second,
            ApplyOutcome::Applied {
                inserted: 0,
                duplicates: 2,
                cursor: Some(121)
            }
        );
        assert_eq!(fx.bars.ids(&series()), vec![60, 120]);
        assert_eq!(fx.keys.cursor_value(&series()), Some(121));
    }

    #[tokio::test]
    async fn storage_error_stops_the_batch_at_the_failure() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);
        fx.bars.fail_on_insert(30);

        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt_1min", vec![bar(50), bar(10), bar(30)]))
            .await;

        assert!(matches!(
            outcome,
            ApplyOutcome::Partial {
                inserted: 1,
                cursor: Some(11),
                ..
            }
        ));
        assert_eq!(fx.bars.ids(&series()), vec![10]);
        assert_eq!(fx.keys.cursor_value(&series()), Some(11));
    }

    #[tokio::test]
    async fn cursor_never_moves_backward() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 1_000);

        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt_1min", vec![bar(60), bar(120)]))
            .await;

        assert!(matches!(
            outcome,
            ApplyOutcome::Applied {
                inserted: 2,
                cursor: Some(1_000),
                ..
            }
        ));
        assert_eq!(fx.keys.cursor_value(&series()), Some(1_000));
    }

    #[tokio::test]
    async fn rejected_and_empty_responses_release_without_mutation() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);
        for start in [0, 60] {
            let permit = fx.admission.acquire().await.unwrap();
            fx.admission
                .register(FetchWindow::new("btcusdt", Granularity::OneMinute, start, start + 60), permit);
        }
        assert_eq!(fx.admission.available(), 0);

        let rejected = fx
            .applier
            .apply(FetchResponse::error("btcusdt_1min", "bad-request", "invalid"))
            .await;
        assert!(matches!(rejected, ApplyOutcome::Rejected { .. }));
        assert_eq!(fx.admission.available(), 1);
        assert_eq!(
            fx.admission.take_requeued(),
            vec![FetchWindow::new("btcusdt", Granularity::OneMinute, 0, 60)]
        );

        let empty = fx.applier.apply(FetchResponse::ok("btcusdt_1min", vec![])).await;
        assert_eq!(empty, ApplyOutcome::Empty);
        assert_eq!(fx.admission.available(), 2);
        assert!(fx.admission.take_requeued().is_empty());

        assert!(fx.bars.ids(&series()).is_empty());
        assert_eq!(fx.keys.cursor_value(&series()), Some(0));
    }

    #[tokio::test]
    async fn partial_batch_is_retried_from_the_last_stored_bar() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);
        fx.bars.fail_on_insert(120);
        let window = FetchWindow::new("btcusdt", Granularity::OneMinute, 0, 18_000);
        let permit = fx.admission.acquire().await.unwrap();
        fx.admission.register(window.clone(), permit);
        let batch = vec![bar(60), bar(120), bar(180)];

        let first = fx.applier.apply(FetchResponse::ok("btcusdt_1min", batch.clone())).await;
        assert!(matches!(first, ApplyOutcome::Partial { cursor: Some(61), .. }));
        assert_eq!(fx.keys.cursor_value(&series()), Some(61));
        assert_eq!(fx.admission.available(), 2);
        assert!(!fx.admission.is_outstanding("btcusdt_1min"));

        let retry = fx.admission.take_requeued_for("btcusdt_1min").unwrap();
        assert_eq!(retry, window);

        fx.bars.recover_insert(120);
        let permit = fx.admission.acquire().await.unwrap();
        fx.admission.register(retry, permit);
        let second = fx.applier.apply(FetchResponse::ok("btcusdt_1min", batch)).await;

        assert_eq!(
            second,
            ApplyOutcome::Applied {
                inserted: 2,
                duplicates: 1,
                cursor: Some(181)
            }
        );
        assert_eq!(fx.bars.ids(&series()), vec![60, 120, 180]);
        assert!(fx.admission.take_requeued().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_bar_id_stores_nothing() {
        let fx = fixture();
        fx.keys.seed_cursor(&series(), 0);
        let permit = fx.admission.acquire().await.unwrap();
        fx.admission
            .register(FetchWindow::new("btcusdt", Granularity::OneMinute, 0, 60), permit);

        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt_1min", vec![bar(60), bar(i64::MAX)]))
            .await;

        assert_eq!(outcome, ApplyOutcome::InvalidBar { bar_id: i64::MAX });
        assert!(fx.bars.ids(&series()).is_empty());
        assert_eq!(fx.keys.cursor_value(&series()), Some(0));
        assert_eq!(fx.admission.available(), 2);
        assert!(fx.admission.take_requeued().is_empty());
    }

    #[tokio::test]
    async fn malformed_id_is_a_protocol_fault() {
        let fx = fixture();
        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt-1min", vec![bar(60)]))
            .await;
        assert_eq!(outcome, ApplyOutcome::InvalidId);
    }

    #[tokio::test]
    async fn missing_cursor_is_initialized_by_the_first_bar() {
        let fx = fixture();
        let outcome = fx
            .applier
            .apply(FetchResponse::ok("btcusdt_1min", vec![bar(600)]))
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Applied {
                cursor: Some(601),
                ..
            }
        ));
    }

    proptest! {
        #[test]
        fn cursor_is_monotonic_and_bounded_by_stored_bars(
            batches in prop::collection::vec(prop::collection::vec(0i64..500, 0..20), 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let fx = fixture();
                fx.keys.seed_cursor(&series(), 0);
                let mut previous = 0;

                for batch in batches {
                    let bars = batch.iter().copied().map(bar).collect();
                    fx.applier.apply(FetchResponse::ok("btcusdt_1min", bars)).await;

                    let cursor = fx.keys.cursor_value(&series()).unwrap();
                    prop_assert!(cursor >= previous);
                    let max_stored = fx.bars.ids(&series()).last().copied();
                    if let Some(max_stored) = max_stored {
                        prop_assert_eq!(cursor, max_stored + 1);
                    } else {
                        prop_assert_eq!(cursor, 0);
                    }
                    previous = cursor;
                }
                Ok(())
            })?;
        }
    }
}
