//! Dashboard-facing cache API and the records it mirrors.

mod coordinator;
pub mod records;

pub use coordinator::{CacheCoordinator, DashboardLoad};
