//! Task Scheduler
//!
//! Produces fetch work for the two run modes and dispatches it through
//! admission control onto the exchange gateway.
//!
//! - **Backfill**: one pass over every `PendingInit` symbol, walking each
//!   series from its cursor to now in windows of at most 300 bars, then
//!   marking the symbol `Active`. A series has one window outstanding at a
//!   time and the next is sent only once the previous one was applied, so
//!   a failed window is fetched again before the walk moves past it. The
//!   series of one symbol walk concurrently. Ends with a `Stop` that drains
//!   every outstanding fetch and stops the connection.
//! - **Runtime**: a pass per cadence over `Active` symbols asking for the
//!   gap since each cursor. Coarse granularities are staggered over a
//!   ten-minute cycle so a symbol never asks for every series at once.
//!
//! The scheduler runs on its own task. Permit waits and store calls never
//! block the connection's I/O task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CursorStore, ExchangeGateway, StoreError, SymbolRegistry};
use crate::application::services::admission::{AdmissionControl, AdmissionError, Permit};
use crate::domain::market::{Granularity, SeriesKey, SymbolState};
use crate::domain::protocol::OutboundFrame;
use crate::domain::task::{FetchWindow, Task};
use crate::infrastructure::metrics;

/// Pause between attempts to queue a backfill fetch that was refused.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Resends of one backfill window before its series is left for the next run.
const MAX_WINDOW_RETRIES: usize = 3;

// =============================================================================
// Errors and Settings
// =============================================================================

/// Errors that end a scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Admission was closed underneath the scheduler.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The symbol registry could not be read or updated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The connection stopped before the work was sent.
    #[error("connection stopped")]
    ConnectionStopped,

    /// Shutdown was requested.
    #[error("scheduler cancelled")]
    Cancelled,
}

/// Which loop the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One-shot historical catch-up.
    Backfill,
    /// Minute-cadence incremental fetching plus live ticks.
    Runtime,
}

impl RunMode {
    /// Mode name used in logs and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Granularities to fetch, in order.
    pub granularities: Vec<Granularity>,
    /// Target period of a runtime pass.
    pub runtime_cadence: Duration,
    /// Wait before re-checking a disconnected connection in runtime mode.
    pub reconnect_wait: Duration,
    /// Age after which an unanswered fetch is given up on.
    pub request_expiry: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            granularities: Granularity::ALL.to_vec(),
            runtime_cadence: Duration::from_secs(60),
            reconnect_wait: Duration::from_secs(5),
            request_expiry: Duration::from_secs(120),
        }
    }
}

/// Totals of a finished backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Symbols marked `Active`.
    pub symbols: usize,
    /// Windows sent for the first time.
    pub windows: usize,
    /// Windows sent again after a reconnect, an expiry or a failed apply.
    pub resent: usize,
    /// Symbols left `PendingInit` because a window kept failing.
    pub incomplete: usize,
}

/// Totals of one series walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeriesWalk {
    windows: usize,
    resent: usize,
    complete: bool,
}

/// Totals of one runtime pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Fetches queued on the connection.
    pub sent: usize,
    /// Fetches the connection refused.
    pub failed: usize,
    /// Series skipped because their gap exceeds one request.
    pub backlogged: usize,
    /// Series skipped because an earlier fetch is still outstanding.
    pub pending: usize,
    /// Requeued windows thrown away.
    pub discarded: usize,
}

// =============================================================================
// Planning
// =============================================================================

/// Walks one series from its cursor towards the present in maximal windows.
#[derive(Debug, Clone)]
pub struct BackfillWindows {
    series: SeriesKey,
    next_start: i64,
}

impl BackfillWindows {
    /// Start walking `series` at `cursor`.
    #[must_use]
    pub const fn new(series: SeriesKey, cursor: i64) -> Self {
        Self {
            series,
            next_start: cursor,
        }
    }

    /// Next window, or `None` once the walk has passed `now`.
    pub fn next_window(&mut self, now: i64) -> Option<FetchWindow> {
        if self.next_start >= now {
            return None;
        }
        let start = self.next_start;
        let end = start + self.series.granularity.max_window_secs();
        self.next_start = end;
        Some(FetchWindow {
            series: self.series.clone(),
            start,
            end,
        })
    }
}

/// What a runtime pass should do for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimePlan {
    /// Less than one bucket has elapsed since the cursor.
    UpToDate,
    /// The gap is more than one request can cover.
    Backlog {
        /// Seconds between cursor and now.
        gap: i64,
    },
    /// Fetch the gap in one request.
    Fetch(FetchWindow),
}

/// Plan the runtime fetch for `series` given its cursor.
#[must_use]
pub fn runtime_window(series: &SeriesKey, cursor: i64, now: i64) -> RuntimePlan {
    let gap = now.saturating_sub(cursor);
    if gap < series.granularity.bucket_secs() {
        RuntimePlan::UpToDate
    } else if gap > series.granularity.max_window_secs() {
        RuntimePlan::Backlog { gap }
    } else {
        RuntimePlan::Fetch(FetchWindow {
            series: series.clone(),
            start: cursor,
            end: now,
        })
    }
}

/// `(period, offset)` in minutes for granularities requested on a stagger.
#[must_use]
pub const fn stagger(granularity: Granularity) -> Option<(i64, i64)> {
    match granularity {
        Granularity::OneMinute => None,
        Granularity::FiveMinutes => Some((5, 1)),
        Granularity::FifteenMinutes => Some((5, 2)),
        Granularity::ThirtyMinutes => Some((5, 3)),
        Granularity::SixtyMinutes => Some((5, 4)),
        Granularity::OneDay => Some((10, 0)),
        Granularity::OneWeek => Some((10, 5)),
    }
}

/// Check whether `granularity` is requested in the given epoch minute.
#[must_use]
pub const fn is_due(granularity: Granularity, epoch_minute: i64) -> bool {
    match stagger(granularity) {
        None => true,
        Some((period, offset)) => epoch_minute.rem_euclid(period) == offset,
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Scheduler
// =============================================================================

/// Emits and dispatches fetch tasks.
pub struct TaskScheduler {
    registry: Arc<dyn SymbolRegistry>,
    cursors: Arc<dyn CursorStore>,
    gateway: Arc<dyn ExchangeGateway>,
    admission: Arc<AdmissionControl>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
}

impl TaskScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(
        registry: Arc<dyn SymbolRegistry>,
        cursors: Arc<dyn CursorStore>,
        gateway: Arc<dyn ExchangeGateway>,
        admission: Arc<AdmissionControl>,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            cursors,
            gateway,
            admission,
            settings,
            cancel,
        }
    }

    /// Run the loop for `mode`.
    ///
    /// # Errors
    ///
    /// See [`Self::run_backfill`] and [`Self::run_runtime`].
    pub async fn run(&self, mode: RunMode) -> Result<(), SchedulerError> {
        match mode {
            RunMode::Backfill => self.run_backfill().await.map(|summary| {
                tracing::info!(
                    symbols = summary.symbols,
                    windows = summary.windows,
                    resent = summary.resent,
                    incomplete = summary.incomplete,
                    "Backfill finished"
                );
            }),
            RunMode::Runtime => self.run_runtime().await,
        }
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Backfill every `PendingInit` symbol, then stop the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails, the connection stops before
    /// all work is sent, or shutdown is requested.
    pub async fn run_backfill(&self) -> Result<BackfillSummary, SchedulerError> {
        if !self.gateway.wait_connected().await {
            return Err(SchedulerError::ConnectionStopped);
        }

        let mut summary = BackfillSummary::default();
        let symbols = self.registry.symbols().await?;
        tracing::info!(symbols = symbols.len(), "Starting backfill");

        for symbol in symbols {
            let state = self.registry.state(&symbol).await?;
            if state != SymbolState::PendingInit {
                tracing::debug!(symbol = %symbol, state = state.as_str(), "Skipping symbol");
                continue;
            }

            let walks = try_join_all(self.settings.granularities.iter().map(|&granularity| {
                self.backfill_series(SeriesKey::new(symbol.clone(), granularity))
            }))
            .await?;

            let mut complete = true;
            for walk in walks {
                summary.windows += walk.windows;
                summary.resent += walk.resent;
                complete &= walk.complete;
            }

            if complete {
                self.dispatch(Task::EndOfSymbol { symbol }).await?;
                summary.symbols += 1;
            } else {
                tracing::warn!(symbol = %symbol, "Backfill incomplete, symbol stays PendingInit");
                summary.incomplete += 1;
            }
        }

        self.dispatch(Task::Stop).await?;
        Ok(summary)
    }

    /// Walk one series to now, one outstanding window at a time.
    ///
    /// Before each new window the previous one must have settled. A window
    /// that came back requeued is sent again first; after
    /// [`MAX_WINDOW_RETRIES`] resends the walk ends incomplete, leaving the
    /// cursor at the last stored bar.
    async fn backfill_series(&self, series: SeriesKey) -> Result<SeriesWalk, SchedulerError> {
        let mut walk = SeriesWalk {
            windows: 0,
            resent: 0,
            complete: true,
        };
        let Some(cursor) = self.read_cursor(&series).await else {
            return Ok(walk);
        };

        let request_id = series.to_string();
        let mut windows = BackfillWindows::new(series, cursor);
        let mut retries = 0;
        loop {
            self.wait_settled(&request_id).await?;

            if let Some(window) = self.admission.take_requeued_for(&request_id) {
                if retries == MAX_WINDOW_RETRIES {
                    tracing::error!(window = %window, retries, "Window keeps failing, abandoning series");
                    walk.complete = false;
                    return Ok(walk);
                }
                retries += 1;
                tracing::info!(window = %window, attempt = retries, "Re-sending window");
                self.dispatch(Task::FetchWindow(window)).await?;
                walk.resent += 1;
                continue;
            }
            retries = 0;

            let Some(window) = windows.next_window(now_secs()) else {
                return Ok(walk);
            };
            self.dispatch(Task::FetchWindow(window)).await?;
            walk.windows += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Runtime
    // -------------------------------------------------------------------------

    /// Run runtime passes until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Admission`] if admission is closed while
    /// the loop is running.
    pub async fn run_runtime(&self) -> Result<(), SchedulerError> {
        tracing::info!(
            cadence_secs = self.settings.runtime_cadence.as_secs(),
            "Starting runtime scheduler"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if !self.gateway.is_connected() {
                tracing::debug!("Connection down, delaying runtime pass");
                if self.pause(self.settings.reconnect_wait).await.is_err() {
                    return Ok(());
                }
                continue;
            }

            let started = Instant::now();
            match self.run_pass().await {
                Ok(pass) => tracing::debug!(
                    sent = pass.sent,
                    failed = pass.failed,
                    backlogged = pass.backlogged,
                    pending = pass.pending,
                    "Runtime pass finished"
                ),
                Err(SchedulerError::Cancelled) => return Ok(()),
                Err(SchedulerError::Admission(e)) => return Err(e.into()),
                Err(e) => tracing::warn!(error = %e, "Runtime pass failed"),
            }

            let pause = self
                .settings
                .runtime_cadence
                .saturating_sub(started.elapsed());
            if self.pause(pause).await.is_err() {
                return Ok(());
            }
        }
    }

    /// One runtime pass over the `Active` symbols.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read, admission is
    /// closed, or shutdown is requested while waiting for a permit.
    pub async fn run_pass(&self) -> Result<PassSummary, SchedulerError> {
        let mut pass = PassSummary::default();

        let expired = self.admission.expire_stale(self.settings.request_expiry);
        if expired > 0 {
            tracing::warn!(expired, "Gave up on unanswered fetches");
        }
        pass.discarded = self.admission.take_requeued().len();

        let now = now_secs();
        let minute = now.div_euclid(60);

        for symbol in self.registry.symbols().await? {
            if self.registry.state(&symbol).await? != SymbolState::Active {
                continue;
            }

            for &granularity in &self.settings.granularities {
                if !is_due(granularity, minute) {
                    continue;
                }
                let series = SeriesKey::new(symbol.clone(), granularity);
                if self.admission.is_outstanding(&series.to_string()) {
                    tracing::debug!(series = %series, "Previous fetch outstanding, skipping");
                    pass.pending += 1;
                    continue;
                }
                let Some(cursor) = self.read_cursor(&series).await else {
                    continue;
                };

                match runtime_window(&series, cursor, now) {
                    RuntimePlan::UpToDate => {}
                    RuntimePlan::Backlog { gap } => {
                        tracing::warn!(
                            series = %series,
                            gap_secs = gap,
                            "Gap exceeds one request, leaving it to backfill"
                        );
                        pass.backlogged += 1;
                    }
                    RuntimePlan::Fetch(window) => {
                        if self.send_fetch(window).await? {
                            pass.sent += 1;
                        } else {
                            pass.failed += 1;
                        }
                    }
                }
            }
        }

        Ok(pass)
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Execute one task.
    ///
    /// A fetch is retried until the connection accepts it; use
    /// [`Self::run_pass`] for send-once semantics.
    ///
    /// # Errors
    ///
    /// Returns an error if admission closes, the connection stops, the
    /// registry update fails, or shutdown is requested.
    pub async fn dispatch(&self, task: Task) -> Result<(), SchedulerError> {
        tracing::trace!(kind = task.kind(), "Dispatching task");
        match task {
            Task::FetchWindow(window) => self.send_until_accepted(window).await,
            Task::EndOfSymbol { symbol } => {
                let _permit = self.acquire().await?;
                self.registry.set_state(&symbol, SymbolState::Active).await?;
                tracing::info!(symbol = %symbol, "Symbol backfilled");
                Ok(())
            }
            Task::Stop => {
                self.drain().await?;
                self.admission.close();
                self.gateway.stop();
                tracing::info!("Scheduler stopped the connection");
                Ok(())
            }
        }
    }

    /// Wait for every outstanding fetch, resending whatever a reconnect or
    /// expiry put back, until nothing is left.
    async fn drain(&self) -> Result<(), SchedulerError> {
        loop {
            let all = self.acquire_all().await?;
            let requeued = self.admission.take_requeued();
            if requeued.is_empty() {
                drop(all);
                return Ok(());
            }
            drop(all);
            for window in requeued {
                self.send_until_accepted(window).await?;
            }
        }
    }

    async fn wait_settled(&self, request_id: &str) -> Result<(), SchedulerError> {
        loop {
            tokio::select! {
                () = self.admission.settled(request_id) => return Ok(()),
                () = tokio::time::sleep(self.settings.request_expiry) => self.sweep_expired(),
                () = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
    }

    async fn send_until_accepted(&self, window: FetchWindow) -> Result<(), SchedulerError> {
        loop {
            if self.send_fetch(window.clone()).await? {
                return Ok(());
            }
            if !self.gateway.wait_connected().await {
                return Err(SchedulerError::ConnectionStopped);
            }
            self.pause(SEND_RETRY_DELAY).await?;
        }
    }

    /// Acquire a permit, register the window and queue its frame.
    ///
    /// Returns `false` if the gateway refused the frame; the permit is
    /// released in that case.
    async fn send_fetch(&self, window: FetchWindow) -> Result<bool, SchedulerError> {
        let permit = self.acquire().await?;
        let frame = OutboundFrame::fetch(&window);
        let request_id = window.request_id();
        self.admission.register(window.clone(), permit);

        let sent = match self.gateway.send(frame) {
            Ok(()) => {
                tracing::debug!(window = %window, "Fetch queued");
                true
            }
            Err(e) => {
                drop(self.admission.withdraw(&request_id));
                tracing::warn!(window = %window, error = %e, "Fetch not sent");
                false
            }
        };
        metrics::set_in_flight(self.admission.in_flight());
        Ok(sent)
    }

    async fn read_cursor(&self, series: &SeriesKey) -> Option<i64> {
        match self.cursors.cursor(series).await {
            Ok(Some(cursor)) => Some(cursor),
            Ok(None) => {
                tracing::warn!(series = %series, "Cursor not initialized, skipping series");
                None
            }
            Err(e) => {
                tracing::warn!(series = %series, error = %e, "Cursor read failed, skipping series");
                None
            }
        }
    }

    async fn acquire(&self) -> Result<Permit, SchedulerError> {
        loop {
            tokio::select! {
                permit = self.admission.acquire() => return Ok(permit?),
                () = tokio::time::sleep(self.settings.request_expiry) => self.sweep_expired(),
                () = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
    }

    async fn acquire_all(&self) -> Result<Permit, SchedulerError> {
        loop {
            tokio::select! {
                permit = self.admission.acquire_all() => return Ok(permit?),
                () = tokio::time::sleep(self.settings.request_expiry) => self.sweep_expired(),
                () = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
    }

    fn sweep_expired(&self) {
        let expired = self.admission.expire_stale(self.settings.request_expiry);
        if expired > 0 {
            tracing::warn!(expired, "Permit wait exceeded expiry, requeued unanswered fetches");
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), SchedulerError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(SchedulerError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SendError;
    use crate::infrastructure::persistence::InMemoryKeyStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use test_case::test_case;

    /// Gateway that records frames and optionally answers them at once.
    struct FakeGateway {
        admission: Arc<AdmissionControl>,
        answer: bool,
        refuse: AtomicUsize,
        reject: AtomicUsize,
        stopped: AtomicBool,
        sent: Mutex<Vec<serde_json::Value>>,
    }

    impl FakeGateway {
        fn new(admission: Arc<AdmissionControl>, answer: bool) -> Arc<Self> {
            Arc::new(Self {
                admission,
                answer,
                refuse: AtomicUsize::new(0),
                reject: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn ranges(&self) -> Vec<(i64, i64)> {
            self.sent
                .lock()
                .iter()
                .map(|v| (v["from"].as_i64().unwrap() - 1, v["to"].as_i64().unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl ExchangeGateway for FakeGateway {
        fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(SendError::Stopped);
            }
            if self.refuse.load(Ordering::SeqCst) > 0 {
                self.refuse.fetch_sub(1, Ordering::SeqCst);
                return Err(SendError::NotConnected);
            }
            self.sent
                .lock()
                .push(serde_json::from_str(&frame.text).unwrap());
            if self.answer {
                let entry = self.admission.complete(frame.request_id.as_deref().unwrap());
                // A rejected answer is requeued the way the applier does it.
                if self.reject.load(Ordering::SeqCst) > 0 {
                    self.reject.fetch_sub(1, Ordering::SeqCst);
                    assert!(self.admission.retry(entry.unwrap()));
                } else {
                    drop(entry);
                }
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }

        async fn wait_connected(&self) -> bool {
            self.is_connected()
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn scheduler(
        store: &Arc<InMemoryKeyStore>,
        gateway: Arc<FakeGateway>,
        admission: Arc<AdmissionControl>,
        granularities: Vec<Granularity>,
    ) -> TaskScheduler {
        TaskScheduler::new(
            Arc::clone(store) as Arc<dyn SymbolRegistry>,
            Arc::clone(store) as Arc<dyn CursorStore>,
            gateway,
            admission,
            SchedulerSettings {
                granularities,
                ..SchedulerSettings::default()
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn backfill_windows_tile_the_gap() {
        let series = SeriesKey::new("btcusdt", Granularity::OneMinute);
        let width = Granularity::OneMinute.max_window_secs();
        let c0 = 1_000;
        let now = c0 + 1_000 * 60;
        let mut walk = BackfillWindows::new(series, c0);
        let windows: Vec<_> = std::iter::from_fn(|| walk.next_window(now)).collect();

        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].start, c0);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(windows.iter().all(|w| w.span_secs() == width));
        assert!(windows.last().unwrap().end >= now);
    }

    #[test]
    fn backfill_walk_chases_a_moving_now() {
        let series = SeriesKey::new("btcusdt", Granularity::OneDay);
        let width = Granularity::OneDay.max_window_secs();
        let mut walk = BackfillWindows::new(series, 0);
        assert!(walk.next_window(width / 2).is_some());
        assert!(walk.next_window(width / 2).is_none());
        assert!(walk.next_window(width + 1).is_some());
    }

    #[test]
    fn cursor_at_now_needs_no_backfill() {
        let mut walk = BackfillWindows::new(SeriesKey::new("a", Granularity::OneMinute), 500);
        assert_eq!(walk.next_window(500), None);
    }

    #[test_case(30, RuntimePlan::UpToDate ; "less than a bucket")]
    #[test_case(300 * 60 + 1, RuntimePlan::Backlog { gap: 300 * 60 + 1 } ; "over one request")]
    fn runtime_plan_without_fetch(gap: i64, expected: RuntimePlan) {
        let series = SeriesKey::new("btcusdt", Granularity::OneMinute);
        assert_eq!(runtime_window(&series, 10_000, 10_000 + gap), expected);
    }

    #[test_case(60 ; "exactly one bucket")]
    #[test_case(300 * 60 ; "exactly one request")]
    fn runtime_plan_fetches_whole_gap(gap: i64) {
        let series = SeriesKey::new("btcusdt", Granularity::OneMinute);
        assert_eq!(
            runtime_window(&series, 10_000, 10_000 + gap),
            RuntimePlan::Fetch(FetchWindow::new(
                "btcusdt",
                Granularity::OneMinute,
                10_000,
                10_000 + gap
            ))
        );
    }

    #[test]
    fn stagger_spreads_coarse_granularities() {
        for minute in 0..600 {
            assert!(is_due(Granularity::OneMinute, minute));
            let due: Vec<_> = Granularity::ALL[1..]
                .iter()
                .filter(|g| is_due(**g, minute))
                .collect();
            assert!(due.len() <= 1, "minute {minute}: {due:?}");
        }
        for granularity in &Granularity::ALL[1..] {
            let hits = (0..10).filter(|m| is_due(*granularity, *m)).count();
            assert!(hits >= 1, "{granularity} never due in ten minutes");
        }
    }

    #[test_case(Granularity::FiveMinutes, 11 ; "five minutes")]
    #[test_case(Granularity::SixtyMinutes, 4 ; "hourly")]
    #[test_case(Granularity::OneDay, 20 ; "daily")]
    #[test_case(Granularity::OneWeek, 15 ; "weekly")]
    fn stagger_slots(granularity: Granularity, minute: i64) {
        assert!(is_due(granularity, minute));
        assert!(!is_due(granularity, minute + 1));
    }

    #[tokio::test]
    async fn backfill_sends_every_window_then_activates() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        store.seed_symbol("ethusdt", SymbolState::Active);
        let series = SeriesKey::new("btcusdt", Granularity::OneMinute);
        let c0 = now_secs() - 1_000 * 60;
        store.seed_cursor(&series, c0);

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            vec![Granularity::OneMinute],
        );

        let summary = scheduler.run_backfill().await.unwrap();
        assert_eq!(summary.symbols, 1);
        assert_eq!(summary.windows, 4);

        let ranges = gateway.ranges();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].0, c0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(store.state_of("btcusdt"), SymbolState::Active);
        assert!(gateway.stopped.load(Ordering::SeqCst));
        assert!(admission.is_closed());
    }

    #[tokio::test]
    async fn backfill_skips_series_without_cursor() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            admission,
            Granularity::ALL.to_vec(),
        );

        let summary = scheduler.run_backfill().await.unwrap();
        assert_eq!(summary.windows, 0);
        assert_eq!(store.state_of("btcusdt"), SymbolState::Active);
    }

    #[tokio::test]
    async fn backfill_retries_refused_fetches() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        let series = SeriesKey::new("btcusdt", Granularity::SixtyMinutes);
        store.seed_cursor(&series, now_secs() - 3_600 * 10);

        let admission = Arc::new(AdmissionControl::new(1));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        gateway.refuse.store(2, Ordering::SeqCst);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            admission,
            vec![Granularity::SixtyMinutes],
        );

        let summary = scheduler.run_backfill().await.unwrap();
        assert_eq!(summary.windows, 1);
        assert_eq!(gateway.ranges().len(), 1);
    }

    #[tokio::test]
    async fn at_most_capacity_fetches_are_outstanding() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        let granularities = vec![
            Granularity::OneMinute,
            Granularity::FiveMinutes,
            Granularity::FifteenMinutes,
        ];
        for &granularity in &granularities {
            store.seed_cursor(
                &SeriesKey::new("btcusdt", granularity),
                now_secs() - 10_000 * 60,
            );
        }

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), false);
        let scheduler = Arc::new(scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            granularities,
        ));

        let task = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_backfill().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ids: Vec<String> = gateway
            .sent
            .lock()
            .iter()
            .map(|v| v["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.available(), 0);

        scheduler.cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(SchedulerError::Cancelled));
    }

    #[tokio::test]
    async fn backfill_keeps_one_window_per_series_outstanding() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        store.seed_cursor(
            &SeriesKey::new("btcusdt", Granularity::OneMinute),
            now_secs() - 10_000 * 60,
        );

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), false);
        let scheduler = Arc::new(scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            vec![Granularity::OneMinute],
        ));

        let task = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_backfill().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gateway.ranges().len(), 1);
        assert_eq!(admission.in_flight(), 1);
        assert_eq!(admission.available(), 1);

        // Settling the first window lets the walk continue where it ended.
        let first = admission.complete("btcusdt_1min").unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ranges = gateway.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].1, ranges[1].0);

        scheduler.cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(SchedulerError::Cancelled));
    }

    #[tokio::test]
    async fn rejected_window_is_resent_before_the_walk_advances() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        let c0 = now_secs() - 1_000 * 60;
        store.seed_cursor(&SeriesKey::new("btcusdt", Granularity::OneMinute), c0);

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        gateway.reject.store(1, Ordering::SeqCst);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            vec![Granularity::OneMinute],
        );

        let summary = scheduler.run_backfill().await.unwrap();
        assert_eq!(summary.windows, 4);
        assert_eq!(summary.resent, 1);
        assert_eq!(summary.symbols, 1);

        let ranges = gateway.ranges();
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0], ranges[1]);
        assert_eq!(ranges[1].0, c0);
        for pair in ranges[1..].windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(store.state_of("btcusdt"), SymbolState::Active);
    }

    #[tokio::test]
    async fn window_that_keeps_failing_leaves_symbol_pending() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::PendingInit);
        let c0 = now_secs() - 1_000 * 60;
        store.seed_cursor(&SeriesKey::new("btcusdt", Granularity::OneMinute), c0);

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        gateway.reject.store(usize::MAX, Ordering::SeqCst);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            vec![Granularity::OneMinute],
        );

        let summary = scheduler.run_backfill().await.unwrap();
        assert_eq!(summary.symbols, 0);
        assert_eq!(summary.incomplete, 1);
        assert_eq!(summary.windows, 1);
        assert_eq!(summary.resent, MAX_WINDOW_RETRIES);

        // The walk never moved past the failing window.
        let ranges = gateway.ranges();
        assert_eq!(ranges.len(), 1 + MAX_WINDOW_RETRIES);
        assert!(ranges.iter().all(|range| range.0 == c0));
        assert_eq!(store.state_of("btcusdt"), SymbolState::PendingInit);
        assert!(gateway.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn runtime_pass_fetches_active_gaps_only() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::Active);
        store.seed_symbol("ethusdt", SymbolState::PendingInit);
        store.seed_symbol("xrpusdt", SymbolState::Active);
        let now = now_secs();
        store.seed_cursor(&SeriesKey::new("btcusdt", Granularity::OneMinute), now - 600);
        store.seed_cursor(&SeriesKey::new("ethusdt", Granularity::OneMinute), now - 600);
        store.seed_cursor(
            &SeriesKey::new("xrpusdt", Granularity::OneMinute),
            now - 301 * 60,
        );

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            admission,
            vec![Granularity::OneMinute],
        );

        let pass = scheduler.run_pass().await.unwrap();
        assert_eq!(pass.sent, 1);
        assert_eq!(pass.backlogged, 1);

        let sent = gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["id"], "btcusdt_1min");
        assert_eq!(sent[0]["from"].as_i64().unwrap(), now - 600 + 1);
    }

    #[tokio::test]
    async fn runtime_skips_series_with_outstanding_fetch() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::Active);
        let now = now_secs();
        store.seed_cursor(&SeriesKey::new("btcusdt", Granularity::OneMinute), now - 600);

        let admission = Arc::new(AdmissionControl::new(2));
        let permit = admission.acquire().await.unwrap();
        admission.register(
            FetchWindow::new("btcusdt", Granularity::OneMinute, now - 660, now - 60),
            permit,
        );
        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        let scheduler = scheduler(
            &store,
            Arc::clone(&gateway),
            admission,
            vec![Granularity::OneMinute],
        );

        let pass = scheduler.run_pass().await.unwrap();
        assert_eq!(pass.pending, 1);
        assert_eq!(pass.sent, 0);
        assert!(gateway.sent.lock().is_empty());
    }

    #[test]
    fn corrupt_cursor_plans_no_fetch() {
        let series = SeriesKey::new("btcusdt", Granularity::OneMinute);
        assert_eq!(
            runtime_window(&series, i64::MIN, 10_000),
            RuntimePlan::Backlog { gap: i64::MAX }
        );
        assert_eq!(runtime_window(&series, i64::MAX, 10_000), RuntimePlan::UpToDate);
    }

    #[tokio::test]
    async fn runtime_send_failure_releases_permit() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.seed_symbol("btcusdt", SymbolState::Active);
        store.seed_cursor(
            &SeriesKey::new("btcusdt", Granularity::OneMinute),
            now_secs() - 600,
        );

        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), false);
        gateway.refuse.store(1, Ordering::SeqCst);
        let scheduler = scheduler(
            &store,
            gateway,
            Arc::clone(&admission),
            vec![Granularity::OneMinute],
        );

        let pass = scheduler.run_pass().await.unwrap();
        assert_eq!(pass.failed, 1);
        assert_eq!(admission.available(), 2);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn runtime_discards_requeued_windows() {
        let store = Arc::new(InMemoryKeyStore::new());
        let admission = Arc::new(AdmissionControl::new(2));
        let permit = admission.acquire().await.unwrap();
        admission.register(FetchWindow::new("a", Granularity::OneMinute, 0, 60), permit);
        admission.reset_in_flight();

        let gateway = FakeGateway::new(Arc::clone(&admission), true);
        let scheduler = scheduler(&store, gateway, Arc::clone(&admission), vec![]);
        let pass = scheduler.run_pass().await.unwrap();
        assert_eq!(pass.discarded, 1);
        assert!(admission.take_requeued().is_empty());
    }

    #[tokio::test]
    async fn stop_waits_for_outstanding_fetches() {
        let store = Arc::new(InMemoryKeyStore::new());
        let admission = Arc::new(AdmissionControl::new(2));
        let gateway = FakeGateway::new(Arc::clone(&admission), false);
        let scheduler = Arc::new(scheduler(
            &store,
            Arc::clone(&gateway),
            Arc::clone(&admission),
            vec![],
        ));

        scheduler
            .dispatch(Task::FetchWindow(FetchWindow::new(
                "btcusdt",
                Granularity::OneMinute,
                0,
                60,
            )))
            .await
            .unwrap();

        let stop = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.dispatch(Task::Stop).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gateway.stopped.load(Ordering::SeqCst));

        drop(admission.complete("btcusdt_1min"));
        stop.await.unwrap().unwrap();
        assert!(gateway.stopped.load(Ordering::SeqCst));
        assert!(admission.is_closed());
    }
}
