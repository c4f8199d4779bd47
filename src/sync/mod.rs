//! Refresh orchestration: single-flight fetches, retries, scheduling,
//! status reporting and change notification.

mod bus;
mod inflight;
mod retry;
mod scheduler;
mod service;
mod status;

pub use bus::{Subscription, SubscriptionBus, SyncEvent};
pub use inflight::InFlightRegistry;
pub use retry::{jitter, AttemptError, RetryController, RetryPolicy};
pub use scheduler::SchedulerHandle;
pub use service::SyncService;
pub use status::{Phase, RefreshStatus, StatusTracker};
