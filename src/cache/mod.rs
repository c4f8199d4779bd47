//! Dataset cache with freshness metadata and offline persistence.
//!
//! - Entries are replaced atomically and never go back in time
//! - Reads are served from memory and never block on I/O
//! - An optional SQLite backend keeps the cache across restarts

mod layer;
mod storage;
mod traits;

pub use layer::CacheStore;
pub use storage::SqliteStorage;
pub use traits::{CacheEntry, CacheSource, CacheStorage, Payload, PayloadMeta};
