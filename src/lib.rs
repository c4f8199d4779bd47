//! Local-first data synchronization for dashboard datasets.
//!
//! [`SyncService`] serves cached payloads synchronously and keeps them
//! up to date in the background, reading pre-generated snapshots first and
//! falling back to remote endpoints.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod sync;

pub use cache::{CacheEntry, CacheSource, CacheStore, Payload, PayloadMeta};
pub use config::{Config, ConfigUpdate, SourceDescriptor, SyncConfig};
pub use error::{FetchError, FetchErrorKind, RefreshError, SyncError};
pub use event::{ConnectivityEvent, WakeReason, WakeSignal};
pub use sync::{RefreshStatus, SchedulerHandle, Subscription, SyncEvent, SyncService};
