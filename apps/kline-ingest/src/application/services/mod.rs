//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `AdmissionControl`: Bounds outstanding exchange requests
//! - `TaskScheduler`: Emits backfill and runtime fetch work
//! - `ResponseApplier`: Stores fetched bars and advances cursors
//! - `TickRelay`: Publishes live ticks and refreshes subscriptions
//! - `IngestHandler`: Routes connection events to the workers

pub mod admission;
pub mod applier;
pub mod handler;
pub mod relay;
pub mod scheduler;

pub use admission::{AdmissionControl, AdmissionError, InFlight, Permit};
pub use applier::{ApplyOutcome, ResponseApplier};
pub use handler::IngestHandler;
pub use relay::{RelayCommand, RelaySettings, ResubscribeThrottle, TickRelay};
pub use scheduler::{
    BackfillSummary, BackfillWindows, PassSummary, RunMode, RuntimePlan, SchedulerError,
    SchedulerSettings, TaskScheduler, is_due, runtime_window,
};
