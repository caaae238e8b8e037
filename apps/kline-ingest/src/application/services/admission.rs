//! Admission Control
//!
//! Bounds the number of outstanding exchange requests. A permit is an
//! owned semaphore permit, so releasing one is dropping it: every exit
//! path of a request gives its permit back exactly once.
//!
//! Outstanding fetches are tracked per request id in FIFO order. The
//! exchange echoes only the id, so two windows of the same series in
//! flight at once are matched oldest first.
//!
//! A series stays outstanding from registration until its [`InFlight`]
//! entry is dropped or requeued, which for a response is after the applier
//! has finished with the batch. [`AdmissionControl::settled`] waits for
//! that point.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::domain::task::FetchWindow;

/// Errors from admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// Admission was closed by shutdown or a `Stop` task.
    #[error("admission control is closed")]
    Closed,
}

/// An acquired admission permit. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit(OwnedSemaphorePermit);

impl Permit {
    /// Number of slots held by this permit.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.0.num_permits()
    }
}

/// Live fetch count per request id.
#[derive(Debug, Default)]
struct Outstanding {
    counts: Mutex<HashMap<String, usize>>,
    settled: Notify,
}

impl Outstanding {
    fn acquire(&self, request_id: &str) {
        *self.counts.lock().entry(request_id.to_string()).or_default() += 1;
    }

    fn release(&self, request_id: &str) {
        {
            let mut counts = self.counts.lock();
            if let Some(count) = counts.get_mut(request_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(request_id);
                }
            }
        }
        self.settled.notify_waiters();
    }

    fn contains(&self, request_id: &str) -> bool {
        self.counts.lock().contains_key(request_id)
    }
}

/// An outstanding fetch and the permit it holds.
///
/// Its series counts as outstanding until the entry is dropped.
#[derive(Debug)]
pub struct InFlight {
    window: FetchWindow,
    issued_at: Instant,
    outstanding: Arc<Outstanding>,
    _permit: Permit,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.outstanding.release(&self.window.request_id());
    }
}

impl InFlight {
    /// The window that was requested.
    #[must_use]
    pub const fn window(&self) -> &FetchWindow {
        &self.window
    }

    /// Time since the request was registered.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

/// Permit pool plus the table of outstanding fetches.
#[derive(Debug)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Mutex<HashMap<String, VecDeque<InFlight>>>,
    outstanding: Arc<Outstanding>,
    requeued: Mutex<VecDeque<FetchWindow>>,
}

impl AdmissionControl {
    /// Create a pool of `capacity` permits (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Mutex::new(HashMap::new()),
            outstanding: Arc::default(),
            requeued: Mutex::new(VecDeque::new()),
        }
    }

    /// Total number of permits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of registered outstanding fetches.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().values().map(VecDeque::len).sum()
    }

    /// Check whether a fetch for `request_id` is registered or still being
    /// applied.
    #[must_use]
    pub fn is_outstanding(&self, request_id: &str) -> bool {
        self.outstanding.contains(request_id)
    }

    /// Wait until no fetch for `request_id` is outstanding.
    ///
    /// A window requeued by a reconnect, an expiry or [`Self::retry`] is in
    /// the requeue before this returns.
    pub async fn settled(&self, request_id: &str) {
        loop {
            let notified = self.outstanding.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.outstanding.contains(request_id) {
                return;
            }
            notified.await;
        }
    }

    /// Check whether admission has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Wait for one permit.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Closed`] once admission is closed, including
    /// for callers already waiting.
    pub async fn acquire(&self) -> Result<Permit, AdmissionError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(Permit)
            .map_err(|_| AdmissionError::Closed)
    }

    /// Wait until every permit is free and hold them all.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Closed`] once admission is closed.
    pub async fn acquire_all(&self) -> Result<Permit, AdmissionError> {
        let slots = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        Arc::clone(&self.semaphore)
            .acquire_many_owned(slots)
            .await
            .map(Permit)
            .map_err(|_| AdmissionError::Closed)
    }

    /// Record a sent fetch together with the permit it consumed.
    pub fn register(&self, window: FetchWindow, permit: Permit) {
        self.outstanding.acquire(&window.request_id());
        let entry = InFlight {
            issued_at: Instant::now(),
            window,
            outstanding: Arc::clone(&self.outstanding),
            _permit: permit,
        };
        self.in_flight
            .lock()
            .entry(entry.window.request_id())
            .or_default()
            .push_back(entry);
    }

    /// Take the oldest outstanding fetch for a response id.
    ///
    /// The permit is released when the returned entry is dropped.
    #[must_use]
    pub fn complete(&self, request_id: &str) -> Option<InFlight> {
        let mut table = self.in_flight.lock();
        let queue = table.get_mut(request_id)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            table.remove(request_id);
        }
        entry
    }

    /// Take back the most recently registered fetch for an id whose frame
    /// could not be queued.
    #[must_use]
    pub fn withdraw(&self, request_id: &str) -> Option<InFlight> {
        let mut table = self.in_flight.lock();
        let queue = table.get_mut(request_id)?;
        let entry = queue.pop_back();
        if queue.is_empty() {
            table.remove(request_id);
        }
        entry
    }

    /// Forget every outstanding fetch after the transport was replaced.
    ///
    /// Permits are released and the windows are queued for re-emission in
    /// the order they were issued. Returns the number of windows requeued.
    pub fn reset_in_flight(&self) -> usize {
        let drained: Vec<InFlight> = self
            .in_flight
            .lock()
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        self.requeue(drained)
    }

    /// Drop outstanding fetches older than `max_age` and requeue them.
    pub fn expire_stale(&self, max_age: Duration) -> usize {
        let mut expired = Vec::new();
        {
            let mut table = self.in_flight.lock();
            for queue in table.values_mut() {
                let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|entry| entry.age() > max_age);
                *queue = fresh;
                expired.extend(stale);
            }
            table.retain(|_, queue| !queue.is_empty());
        }
        self.requeue(expired)
    }

    /// Put a fetch whose response could not be applied back in the
    /// requeue, releasing its permit. Returns `false` once admission is
    /// closed.
    pub fn retry(&self, entry: InFlight) -> bool {
        self.requeue(vec![entry]) == 1
    }

    /// Take every window waiting to be re-emitted.
    #[must_use]
    pub fn take_requeued(&self) -> Vec<FetchWindow> {
        self.requeued.lock().drain(..).collect()
    }

    /// Take the oldest requeued window for `request_id`.
    #[must_use]
    pub fn take_requeued_for(&self, request_id: &str) -> Option<FetchWindow> {
        let mut requeued = self.requeued.lock();
        let index = requeued
            .iter()
            .position(|window| window.request_id() == request_id)?;
        requeued.remove(index)
    }

    /// Close admission: waiters fail with `Closed` and every permit held
    /// by an outstanding fetch is released.
    pub fn close(&self) {
        self.semaphore.close();
        self.in_flight.lock().clear();
        self.requeued.lock().clear();
    }

    fn requeue(&self, mut entries: Vec<InFlight>) -> usize {
        if self.is_closed() {
            return 0;
        }
        entries.sort_by_key(|entry| entry.issued_at);
        self.requeued
            .lock()
            .extend(entries.iter().map(|entry| entry.window.clone()));
        // Entries drop after the windows are visible to `settled` waiters.
        entries.len()
    }
}
