//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Trait for records that can be stored in a local partition.
///
/// Implementors must provide a unique cache key; the partition they belong
/// to is fixed per type.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Primary key inside the partition (stable across syncs)
  fn cache_key(&self) -> String;

  /// Partition name for storage organization (e.g., "clients", "payments")
  fn partition() -> &'static str;
}

/// A document mirrored from the remote store.
///
/// The `id` and the locally stamped `cache_updated_at` are shared by every
/// partition; the partition-specific fields are flattened next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<T> {
  pub id: String,
  /// When this record was last merged locally (not the remote modification time)
  pub cache_updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub data: T,
}

impl<T> CacheRecord<T> {
  /// Wrap `data` under `id`, stamped with the current time.
  pub fn stamp(id: impl Into<String>, data: T) -> Self {
    Self {
      id: id.into(),
      cache_updated_at: Utc::now(),
      data,
    }
  }
}

/// Ties a record body to the partition it is mirrored into.
pub trait PartitionData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  const PARTITION: &'static str;
}

impl<T: PartitionData> Cacheable for CacheRecord<T> {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn partition() -> &'static str {
    T::PARTITION
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Map, Value};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    title: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
  }

  impl PartitionData for Note {
    const PARTITION: &'static str = "notes";
  }

  #[test]
  fn test_record_flattens_base_fields() {
    let mut fields = Map::new();
    fields.insert("color".into(), json!("red"));
    let record = CacheRecord::stamp(
      "n1",
      Note {
        title: "hello".into(),
        fields,
      },
    );

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["id"], "n1");
    assert_eq!(value["title"], "hello");
    assert_eq!(value["color"], "red");
    assert!(value.get("cacheUpdatedAt").is_some());

    let back: CacheRecord<Note> = serde_json::from_value(value).unwrap();
    assert_eq!(back, record);
    assert_eq!(back.cache_key(), "n1");
    assert_eq!(CacheRecord::<Note>::partition(), "notes");
  }
}
