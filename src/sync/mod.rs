//! Incremental synchronization from the remote document store.
//!
//! Only documents modified after the last successful pass are fetched;
//! they are merged into the local mirror, which is returned whole.

mod engine;
mod remote;
mod snapshot;

pub use engine::{DashboardData, DependentData, PrimaryData, SyncEngine, SyncSettings};
pub use remote::{CollectionPath, DeltaQuery, InMemoryRemote, ModifiedAfter, RemoteDocument, RemoteStore};
pub use snapshot::SnapshotRemote;
