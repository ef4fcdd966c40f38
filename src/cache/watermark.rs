//! Persisted "last successful sync" timestamp.
//!
//! The watermark bounds the delta query of the next sync pass. It never
//! moves backwards; the only way to unset it is a full store clear.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::storage::PersistentStore;

/// Metadata key the watermark is stored under.
pub const WATERMARK_KEY: &str = "lastSyncTime";

pub struct SyncWatermark {
  store: PersistentStore,
  /// In-memory copy; `None` until first loaded from the store
  current: Mutex<Option<Option<DateTime<Utc>>>>,
}

impl SyncWatermark {
  pub fn new(store: PersistentStore) -> Self {
    Self {
      store,
      current: Mutex::new(None),
    }
  }

  /// Read the persisted watermark.
  ///
  /// `None` means a sync pass has never completed and everything must be
  /// fetched.
  pub async fn load(&self) -> Result<Option<DateTime<Utc>>> {
    let mut current = self.current.lock().await;
    let value = match self.store.get_meta(WATERMARK_KEY).await? {
      Some(raw) => Some(parse_timestamp(&raw)?),
      None => None,
    };
    *current = Some(value);
    debug!(watermark = ?value, "Loaded sync watermark");
    Ok(value)
  }

  /// Last value seen by [`load`](Self::load) or [`advance`](Self::advance),
  /// without touching storage.
  pub async fn cached(&self) -> Option<DateTime<Utc>> {
    self.current.lock().await.flatten()
  }

  /// Persist `at` as the new watermark, unless the stored one is later.
  ///
  /// The in-memory copy changes only once the store write succeeded.
  /// Returns the effective watermark.
  pub async fn advance(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let mut current = self.current.lock().await;

    let stored = match self.store.get_meta(WATERMARK_KEY).await? {
      Some(raw) => Some(parse_timestamp(&raw)?),
      None => None,
    };
    let next = stored.map_or(at, |prev| prev.max(at));

    self.store.put_meta(WATERMARK_KEY, &next.to_rfc3339()).await?;
    *current = Some(Some(next));

    info!(watermark = %next, "Advanced sync watermark");
    Ok(next)
  }

  /// Drop the in-memory copy after the store was cleared.
  pub(crate) async fn forget(&self) {
    *self.current.lock().await = Some(None);
  }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(raw)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse sync watermark '{}': {}", raw, e))
}
