//! Local mirror of the coaching dashboard's remote document store.
//!
//! The first load copies every tracked collection into a local SQLite
//! mirror; later loads fetch only documents modified since the last
//! successful sync. A separate TTL cache holds short-lived computed values.

pub mod cache;
pub mod config;
pub mod dashboard;
pub mod logging;
pub mod sync;

pub use cache::{CacheStats, EphemeralCache, PersistentStore, StoreLocation};
pub use config::Config;
pub use dashboard::{CacheCoordinator, DashboardLoad};
pub use sync::{DashboardData, RemoteStore, SyncEngine};
