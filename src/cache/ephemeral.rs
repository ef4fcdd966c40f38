//! Best-effort TTL cache for short-lived computed values.
//!
//! Lookups go to an in-memory map first and fall back to a partition of a
//! [`PersistentStore`]. Expired entries are treated as absent whenever they
//! are read. The memory tier also drops every expired entry on `set` and
//! `stats`; the durable tier keeps them until overwritten or cleared.
//!
//! No method here returns an error: failures are logged and reported as
//! "absent", `false`, or degraded stats.

use chrono::Utc;
use color_eyre::Result;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::storage::{PartitionSpec, PersistentStore};
use super::traits::Cacheable;

/// Partition holding ephemeral entries.
pub const EPHEMERAL_PARTITION: &str = "cache";

/// Schema for the store backing an [`EphemeralCache`].
pub const EPHEMERAL_SCHEMA: &[PartitionSpec] = &[PartitionSpec {
  name: EPHEMERAL_PARTITION,
  indexes: &["expiry"],
}];

/// A value with an absolute expiry (unix milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralEntry {
  pub key: String,
  pub value: Value,
  pub expiry: i64,
}

impl EphemeralEntry {
  fn is_live(&self, now: i64) -> bool {
    self.expiry > now
  }
}

impl Cacheable for EphemeralEntry {
  fn cache_key(&self) -> String {
    self.key.clone()
  }

  fn partition() -> &'static str {
    EPHEMERAL_PARTITION
  }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
  value: Value,
  expiry: i64,
}

/// Entry counts for both tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  /// Entries in durable storage (expired ones included until overwritten)
  pub entries: u64,
  /// Live entries in the in-memory tier
  pub memory_entries: usize,
  pub location: String,
  /// Set when the durable count could not be read
  pub degraded: Option<String>,
}

pub struct EphemeralCache {
  store: PersistentStore,
  memory: DashMap<String, MemoryEntry>,
}

impl EphemeralCache {
  pub fn new(store: PersistentStore) -> Self {
    Self {
      store,
      memory: DashMap::new(),
    }
  }

  /// Make sure the backing store is open. Safe to call repeatedly.
  pub async fn init(&self) -> Result<()> {
    self.store.open().await
  }

  /// Store `value` under `key` for `ttl`, replacing any previous entry.
  ///
  /// Returns `false` if the value could not be serialized or persisted.
  pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
    match self.try_set(key, value, ttl).await {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "Failed to set ephemeral cache entry");
        false
      }
    }
  }

  async fn try_set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
    let value = serde_json::to_value(value)?;
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let now = now_ms();
    let expiry = now.saturating_add(ttl_ms);

    self.evict_expired(now);
    self.memory.insert(
      key.to_string(),
      MemoryEntry {
        value: value.clone(),
        expiry,
      },
    );

    self.init().await?;
    self
      .store
      .put_many(&[EphemeralEntry {
        key: key.to_string(),
        value,
        expiry,
      }])
      .await?;

    Ok(())
  }

  /// Live value for `key`, or `None` when absent, expired, or unreadable.
  ///
  /// `None` means "compute and set", never "something failed".
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = match self.try_get(key).await {
      Ok(value) => value?,
      Err(e) => {
        warn!(key, error = %e, "Failed to read ephemeral cache entry");
        return None;
      }
    };

    match serde_json::from_value(value) {
      Ok(v) => Some(v),
      Err(e) => {
        warn!(key, error = %e, "Cached value has an unexpected shape");
        None
      }
    }
  }

  async fn try_get(&self, key: &str) -> Result<Option<Value>> {
    let now = now_ms();

    let hot = self
      .memory
      .get(key)
      .filter(|e| e.expiry > now)
      .map(|e| e.value.clone());
    if hot.is_some() {
      return Ok(hot);
    }
    self.memory.remove_if(key, |_, e| e.expiry <= now);

    self.init().await?;
    match self.store.get::<EphemeralEntry>(key).await? {
      Some(entry) if entry.is_live(now) => {
        debug!(key, "Promoted ephemeral entry to memory");
        self.memory.insert(
          key.to_string(),
          MemoryEntry {
            value: entry.value.clone(),
            expiry: entry.expiry,
          },
        );
        Ok(Some(entry.value))
      }
      _ => Ok(None),
    }
  }

  /// Cached value for `key`, or compute it with `f` and cache it for `ttl`.
  ///
  /// Only errors from `f` itself are returned.
  pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(cached) = self.get(key).await {
      return Ok(cached);
    }

    let value = f().await?;
    self.set(key, &value, ttl).await;
    Ok(value)
  }

  /// Remove `key` from both tiers. Removing an absent key succeeds.
  pub async fn delete(&self, key: &str) -> bool {
    self.memory.remove(key);

    let result = async {
      self.init().await?;
      self.store.delete::<EphemeralEntry>(key).await
    }
    .await;

    match result {
      Ok(_) => true,
      Err(e) => {
        warn!(key, error = %e, "Failed to delete ephemeral cache entry");
        false
      }
    }
  }

  /// Drop every entry from both tiers.
  pub async fn clear_all(&self) -> bool {
    self.memory.clear();

    let result = async {
      self.init().await?;
      self.store.clear_all().await
    }
    .await;

    match result {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Failed to clear ephemeral cache");
        false
      }
    }
  }

  pub async fn stats(&self) -> CacheStats {
    self.evict_expired(now_ms());
    let location = self.store.location().to_string();

    let count = async {
      self.init().await?;
      self.store.count(EPHEMERAL_PARTITION).await
    }
    .await;

    match count {
      Ok(entries) => CacheStats {
        entries,
        memory_entries: self.memory.len(),
        location,
        degraded: None,
      },
      Err(e) => {
        warn!(error = %e, "Failed to read ephemeral cache stats");
        CacheStats {
          entries: 0,
          memory_entries: self.memory.len(),
          location,
          degraded: Some(e.to_string()),
        }
      }
    }
  }

  /// Drop expired entries from the memory tier.
  fn evict_expired(&self, now: i64) {
    self.memory.retain(|_, e| e.expiry > now);
  }
}

fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::StoreLocation;
  use color_eyre::eyre::eyre;
  use serde_json::json;

  fn cache() -> (PersistentStore, EphemeralCache) {
    let store = PersistentStore::new(StoreLocation::Memory, EPHEMERAL_SCHEMA);
    (store.clone(), EphemeralCache::new(store))
  }

  #[tokio::test]
  async fn test_set_then_get() {
    let (_, cache) = cache();
    assert!(cache.set("k", &json!({"total": 3}), Duration::from_secs(60)).await);

    let v: Option<Value> = cache.get("k").await;
    assert_eq!(v, Some(json!({"total": 3})));
  }

  #[tokio::test]
  async fn test_missing_key_is_absent() {
    let (_, cache) = cache();
    assert_eq!(cache.get::<Value>("nope").await, None);
  }

  #[tokio::test]
  async fn test_zero_ttl_is_absent() {
    let (_, cache) = cache();
    assert!(cache.set("k", &1u32, Duration::ZERO).await);
    assert_eq!(cache.get::<u32>("k").await, None);
  }

  #[tokio::test]
  async fn test_expires_after_ttl() {
    let (_, cache) = cache();
    cache.set("k", &"v", Duration::from_millis(20)).await;
    assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get::<String>("k").await, None);
  }

  #[tokio::test]
  async fn test_durable_tier_promotes_to_memory() {
    let (store, cache) = cache();
    cache.set("k", &42u32, Duration::from_secs(60)).await;

    // Fresh cache over the same store: empty memory tier
    let restarted = EphemeralCache::new(store);
    assert_eq!(restarted.stats().await.memory_entries, 0);
    assert_eq!(restarted.get::<u32>("k").await, Some(42));
    assert_eq!(restarted.stats().await.memory_entries, 1);
  }

  #[tokio::test]
  async fn test_set_overwrites() {
    let (_, cache) = cache();
    cache.set("k", &1u32, Duration::from_secs(60)).await;
    cache.set("k", &2u32, Duration::from_secs(60)).await;
    assert_eq!(cache.get::<u32>("k").await, Some(2));
    assert_eq!(cache.stats().await.entries, 1);
  }

  #[tokio::test]
  async fn test_delete_is_idempotent() {
    let (_, cache) = cache();
    cache.set("k", &1u32, Duration::from_secs(60)).await;
    assert!(cache.delete("k").await);
    assert!(cache.delete("k").await);
    assert_eq!(cache.get::<u32>("k").await, None);
  }

  #[tokio::test]
  async fn test_stats_and_clear_all() {
    let (_, cache) = cache();
    cache.set("a", &1u32, Duration::from_secs(60)).await;
    cache.set("b", &2u32, Duration::from_secs(60)).await;

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.memory_entries, 2);
    assert_eq!(stats.degraded, None);

    assert!(cache.clear_all().await);
    let stats = cache.stats().await;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.memory_entries, 0);
  }

  #[tokio::test]
  async fn test_stats_degrade_instead_of_failing() {
    // A store that cannot be opened: its parent path is a regular file
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let store = PersistentStore::new(
      StoreLocation::File(blocker.join("cache.db")),
      EPHEMERAL_SCHEMA,
    );
    let cache = EphemeralCache::new(store);

    assert!(!cache.set("k", &1u32, Duration::from_secs(60)).await);
    let stats = cache.stats().await;
    assert_eq!(stats.entries, 0);
    assert!(stats.degraded.is_some());
  }

  #[tokio::test]
  async fn test_unread_expired_entries_leave_memory() {
    let (_, cache) = cache();
    cache.set("short", &1u32, Duration::from_millis(10)).await;
    cache.set("long", &2u32, Duration::from_secs(60)).await;
    assert_eq!(cache.memory.len(), 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cache.stats().await.memory_entries, 1);

    cache.set("other", &3u32, Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    cache.set("last", &4u32, Duration::from_secs(60)).await;
    assert!(!cache.memory.contains_key("other"));
    assert_eq!(cache.memory.len(), 2);
  }

  #[tokio::test]
  async fn test_get_or_compute_caches_result() {
    let (_, cache) = cache();
    let first: u32 = cache
      .get_or_compute("k", Duration::from_secs(60), || async { Ok(7) })
      .await
      .unwrap();
    assert_eq!(first, 7);

    let second: u32 = cache
      .get_or_compute("k", Duration::from_secs(60), || async {
        Err(eyre!("should not be called"))
      })
      .await
      .unwrap();
    assert_eq!(second, 7);
  }
}
