//! Partitioned local store backed by SQLite.
//!
//! Every partition shares one `records` table keyed by `(partition, id)`,
//! with the record serialized as JSON. Secondary indexes are SQLite
//! expression indexes over `json_extract(data, '$.<field>')`, declared per
//! partition when the store is provisioned.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::traits::Cacheable;

/// A named partition and the record fields it is indexed by.
#[derive(Debug, Clone, Copy)]
pub struct PartitionSpec {
  pub name: &'static str,
  pub indexes: &'static [&'static str],
}

/// Where the SQLite database lives.
#[derive(Debug, Clone)]
pub enum StoreLocation {
  File(PathBuf),
  Memory,
}

impl std::fmt::Display for StoreLocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StoreLocation::File(path) => write!(f, "{}", path.display()),
      StoreLocation::Memory => f.write_str(":memory:"),
    }
  }
}

/// Durable, partitioned key/value store.
///
/// Cloning is cheap and every clone shares the same connection. The
/// connection is opened lazily by the first operation (or an explicit
/// [`PersistentStore::open`]); concurrent openers wait for that single
/// initialization instead of provisioning twice.
#[derive(Clone)]
pub struct PersistentStore {
  inner: Arc<StoreInner>,
}

struct StoreInner {
  location: StoreLocation,
  partitions: &'static [PartitionSpec],
  conn: OnceCell<Arc<Mutex<Connection>>>,
}

/// Schema shared by every partition.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    partition TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, id)
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl PersistentStore {
  pub fn new(location: StoreLocation, partitions: &'static [PartitionSpec]) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        location,
        partitions,
        conn: OnceCell::new(),
      }),
    }
  }

  pub fn location(&self) -> &StoreLocation {
    &self.inner.location
  }

  /// Open the database and provision every declared partition and index.
  ///
  /// Idempotent: later calls reuse the connection opened by the first one.
  pub async fn open(&self) -> Result<()> {
    self.connection().await.map(|_| ())
  }

  async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
    let location = self.inner.location.clone();
    let partitions = self.inner.partitions;

    let conn = self
      .inner
      .conn
      .get_or_try_init(|| async move {
        tokio::task::spawn_blocking(move || provision(&location, partitions))
          .await
          .map_err(|e| eyre!("Storage open task failed: {}", e))?
          .map(|conn| Arc::new(Mutex::new(conn)))
      })
      .await?;

    Ok(Arc::clone(conn))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let conn = self.connection().await?;

    tokio::task::spawn_blocking(move || {
      let mut guard = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&mut guard)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }

  fn partition(&self, name: &str) -> Result<&'static PartitionSpec> {
    self
      .inner
      .partitions
      .iter()
      .find(|p| p.name == name)
      .ok_or_else(|| eyre!("Unknown partition '{}'", name))
  }

  /// Every record currently stored in `T`'s partition, order undefined.
  pub async fn get_all<T: Cacheable>(&self) -> Result<Vec<T>> {
    let partition = self.partition(T::partition())?.name;

    let rows = self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare("SELECT id, data FROM records WHERE partition = ?1")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows = stmt
          .query_map(params![partition], |row| Ok((row.get(0)?, row.get(1)?)))
          .map_err(|e| eyre!("Failed to read partition {}: {}", partition, e))?
          .collect::<rusqlite::Result<Vec<(String, String)>>>()
          .map_err(|e| eyre!("Failed to read partition {}: {}", partition, e))?;

        Ok(rows)
      })
      .await?;

    Ok(decode_rows(partition, rows))
  }

  /// Records of `T`'s partition whose indexed `field` equals `value`.
  pub async fn get_all_by_index<T: Cacheable>(
    &self,
    field: &str,
    value: impl Into<Value>,
  ) -> Result<Vec<T>> {
    let spec = self.partition(T::partition())?;
    let field = *spec
      .indexes
      .iter()
      .find(|f| **f == field)
      .ok_or_else(|| eyre!("Partition '{}' has no index on '{}'", spec.name, field))?;
    let partition = spec.name;
    let key = sql_value(value.into());

    let rows = self
      .with_conn(move |conn| {
        // Literal partition/field so the planner can match the partial expression index
        let sql = format!(
          "SELECT id, data FROM records
           WHERE partition = '{partition}' AND json_extract(data, '$.{field}') = ?1"
        );
        let mut stmt = conn
          .prepare(&sql)
          .map_err(|e| eyre!("Failed to prepare index query: {}", e))?;

        let rows = stmt
          .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
          .map_err(|e| eyre!("Failed to query index {}.{}: {}", partition, field, e))?
          .collect::<rusqlite::Result<Vec<(String, String)>>>()
          .map_err(|e| eyre!("Failed to query index {}.{}: {}", partition, field, e))?;

        Ok(rows)
      })
      .await?;

    Ok(decode_rows(partition, rows))
  }

  /// A single record by primary key.
  pub async fn get<T: Cacheable>(&self, id: &str) -> Result<Option<T>> {
    let partition = self.partition(T::partition())?.name;
    let id = id.to_string();

    let data: Option<String> = self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT data FROM records WHERE partition = ?1 AND id = ?2",
            params![partition, id],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}/{}: {}", partition, id, e))
      })
      .await?;

    data
      .map(|data| {
        serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize record in {}: {}", partition, e))
      })
      .transpose()
  }

  /// Upsert `records` by primary key in a single transaction.
  ///
  /// Either every record is written or none is. Returns the number written.
  pub async fn put_many<T: Cacheable>(&self, records: &[T]) -> Result<usize> {
    let partition = self.partition(T::partition())?.name;
    if records.is_empty() {
      return Ok(0);
    }

    let rows = records
      .iter()
      .map(|r| {
        serde_json::to_string(r)
          .map(|data| (r.cache_key(), data))
          .map_err(|e| eyre!("Failed to serialize record for {}: {}", partition, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let written = self
      .with_conn(move |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        {
          let mut stmt = tx
            .prepare(
              "INSERT OR REPLACE INTO records (partition, id, data, stored_at)
               VALUES (?1, ?2, ?3, datetime('now'))",
            )
            .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

          for (id, data) in &rows {
            stmt
              .execute(params![partition, id, data])
              .map_err(|e| eyre!("Failed to store {}/{}: {}", partition, id, e))?;
          }
        }

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

        Ok(rows.len())
      })
      .await?;

    debug!(partition, written, "Stored records");
    Ok(written)
  }

  /// Remove one record. Returns whether it existed.
  pub async fn delete<T: Cacheable>(&self, id: &str) -> Result<bool> {
    let partition = self.partition(T::partition())?.name;
    let id = id.to_string();

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "DELETE FROM records WHERE partition = ?1 AND id = ?2",
            params![partition, id],
          )
          .map(|n| n > 0)
          .map_err(|e| eyre!("Failed to delete {}/{}: {}", partition, id, e))
      })
      .await
  }

  pub async fn count(&self, partition: &str) -> Result<u64> {
    let partition = self.partition(partition)?.name;

    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT COUNT(*) FROM records WHERE partition = ?1",
            params![partition],
            |row| row.get::<_, i64>(0),
          )
          .map(|n| n as u64)
          .map_err(|e| eyre!("Failed to count {}: {}", partition, e))
      })
      .await
  }

  pub async fn clear(&self, partition: &str) -> Result<()> {
    let partition = self.partition(partition)?.name;

    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM records WHERE partition = ?1", params![partition])
          .map_err(|e| eyre!("Failed to clear {}: {}", partition, e))?;
        Ok(())
      })
      .await
  }

  /// Remove every record from every partition, and all metadata.
  pub async fn clear_all(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
        tx.execute_batch("DELETE FROM records; DELETE FROM metadata;")
          .map_err(|e| eyre!("Failed to clear store: {}", e))?;
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      })
      .await
  }

  pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_string();

    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read metadata {}: {}", key, e))
      })
      .await
  }

  pub async fn put_meta(&self, key: &str, value: &str) -> Result<()> {
    let key = key.to_string();
    let value = value.to_string();

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
          )
          .map_err(|e| eyre!("Failed to write metadata {}: {}", key, e))?;
        Ok(())
      })
      .await
  }
}

/// Open the database and create tables and indexes that are missing.
fn provision(location: &StoreLocation, partitions: &[PartitionSpec]) -> Result<Connection> {
  let conn = match location {
    StoreLocation::File(path) => {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
      Connection::open(path)
        .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?
    }
    StoreLocation::Memory => Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?,
  };

  conn
    .execute_batch(STORE_SCHEMA)
    .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

  for spec in partitions {
    if !is_identifier(spec.name) {
      return Err(eyre!("Invalid partition name '{}'", spec.name));
    }
    for field in spec.indexes {
      if !is_identifier(field) {
        return Err(eyre!("Invalid index field '{}' on {}", field, spec.name));
      }
      let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{p}_{f} ON records(json_extract(data, '$.{f}'))
         WHERE partition = '{p}'",
        p = spec.name,
        f = field
      );
      conn
        .execute_batch(&sql)
        .map_err(|e| eyre!("Failed to create index {}.{}: {}", spec.name, field, e))?;
    }
  }

  debug!(location = %location, partitions = partitions.len(), "Opened cache store");
  Ok(conn)
}

fn is_identifier(s: &str) -> bool {
  !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Map a JSON value to what `json_extract` yields for it.
fn sql_value(value: Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(b as i64),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s),
    other => SqlValue::Text(other.to_string()),
  }
}

fn decode_rows<T: Cacheable>(partition: &str, rows: Vec<(String, String)>) -> Vec<T> {
  rows
    .into_iter()
    .filter_map(|(id, data)| match serde_json::from_str(&data) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!(partition, id = %id, error = %e, "Skipping unreadable cached record");
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{CacheRecord, PartitionData};
  use serde::{Deserialize, Serialize};
  use serde_json::json;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  #[serde(rename_all = "camelCase")]
  struct Item {
    owner_id: String,
    qty: i64,
  }

  impl PartitionData for Item {
    const PARTITION: &'static str = "items";
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Stray {
    n: i64,
  }

  impl PartitionData for Stray {
    const PARTITION: &'static str = "stray";
  }

  const SCHEMA: &[PartitionSpec] = &[
    PartitionSpec {
      name: "items",
      indexes: &["ownerId"],
    },
    PartitionSpec {
      name: "plain",
      indexes: &[],
    },
  ];

  fn item(id: &str, owner: &str, qty: i64) -> CacheRecord<Item> {
    CacheRecord::stamp(
      id,
      Item {
        owner_id: owner.into(),
        qty,
      },
    )
  }

  fn memory_store() -> PersistentStore {
    PersistentStore::new(StoreLocation::Memory, SCHEMA)
  }

  #[tokio::test]
  async fn test_put_many_then_get_all() {
    let store = memory_store();
    let written = store
      .put_many(&[item("a", "o1", 1), item("b", "o2", 2)])
      .await
      .unwrap();
    assert_eq!(written, 2);

    let mut all: Vec<CacheRecord<Item>> = store.get_all().await.unwrap();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].data.qty, 2);
    assert_eq!(store.count("items").await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_put_is_last_write_wins() {
    let store = memory_store();
    store.put_many(&[item("a", "o1", 1)]).await.unwrap();
    store.put_many(&[item("a", "o1", 7)]).await.unwrap();

    let all: Vec<CacheRecord<Item>> = store.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].data.qty, 7);

    let one: Option<CacheRecord<Item>> = store.get("a").await.unwrap();
    assert_eq!(one.unwrap().data.qty, 7);
  }

  #[tokio::test]
  async fn test_index_lookup() {
    let store = memory_store();
    store
      .put_many(&[item("a", "o1", 1), item("b", "o1", 2), item("c", "o2", 3)])
      .await
      .unwrap();

    let owned: Vec<CacheRecord<Item>> = store.get_all_by_index("ownerId", "o1").await.unwrap();
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|r| r.data.owner_id == "o1"));

    let none: Vec<CacheRecord<Item>> = store.get_all_by_index("ownerId", "zz").await.unwrap();
    assert!(none.is_empty());
  }

  #[tokio::test]
  async fn test_undeclared_index_and_partition_fail() {
    let store = memory_store();
    let by_qty = store.get_all_by_index::<CacheRecord<Item>>("qty", json!(1)).await;
    assert!(by_qty.is_err());

    let stray = store.get_all::<CacheRecord<Stray>>().await;
    assert!(stray.is_err());
  }

  #[tokio::test]
  async fn test_delete_and_clear() {
    let store = memory_store();
    store
      .put_many(&[item("a", "o1", 1), item("b", "o1", 2)])
      .await
      .unwrap();

    assert!(store.delete::<CacheRecord<Item>>("a").await.unwrap());
    assert!(!store.delete::<CacheRecord<Item>>("a").await.unwrap());
    assert_eq!(store.count("items").await.unwrap(), 1);

    store.clear("items").await.unwrap();
    assert_eq!(store.count("items").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_clear_all_drops_metadata() {
    let store = memory_store();
    store.put_many(&[item("a", "o1", 1)]).await.unwrap();
    store.put_meta("k", "v").await.unwrap();
    assert_eq!(store.get_meta("k").await.unwrap().as_deref(), Some("v"));

    store.clear_all().await.unwrap();
    assert_eq!(store.count("items").await.unwrap(), 0);
    assert_eq!(store.get_meta("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_concurrent_open_shares_connection() {
    let store = memory_store();
    let (a, b) = tokio::join!(store.open(), store.open());
    a.unwrap();
    b.unwrap();

    // An in-memory database opened twice would not see this write
    let other = store.clone();
    store.put_many(&[item("a", "o1", 1)]).await.unwrap();
    assert_eq!(other.count("items").await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = PersistentStore::new(StoreLocation::File(path.clone()), SCHEMA);
      store.put_many(&[item("a", "o1", 1)]).await.unwrap();
      store.put_meta("k", "v").await.unwrap();
    }

    let store = PersistentStore::new(StoreLocation::File(path), SCHEMA);
    let all: Vec<CacheRecord<Item>> = store.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(store.get_meta("k").await.unwrap().as_deref(), Some("v"));
  }
}
