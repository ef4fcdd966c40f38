//! Local storage for the dashboard mirror and the ephemeral TTL cache.
//!
//! - [`PersistentStore`]: partitioned SQLite key/value store with secondary indexes
//! - [`SyncWatermark`]: persisted "last successful sync" timestamp
//! - [`EphemeralCache`]: best-effort two-tier TTL cache for computed values

mod ephemeral;
mod storage;
mod traits;
mod watermark;

pub use ephemeral::{CacheStats, EphemeralCache, EphemeralEntry, EPHEMERAL_SCHEMA};
pub use storage::{PartitionSpec, PersistentStore, StoreLocation};
pub use traits::{CacheRecord, Cacheable, PartitionData};
pub use watermark::{SyncWatermark, WATERMARK_KEY};
