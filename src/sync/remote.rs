//! Remote document store consumed by the sync engine.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Location of a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionPath {
  /// A top-level collection (e.g., `clients`)
  Root { collection: String },
  /// A sub-collection under one parent document (e.g., `clients/c1/payments`)
  Nested {
    parent_collection: String,
    parent_id: String,
    collection: String,
  },
}

impl CollectionPath {
  pub fn root(collection: impl Into<String>) -> Self {
    Self::Root {
      collection: collection.into(),
    }
  }

  pub fn nested(
    parent_collection: impl Into<String>,
    parent_id: impl Into<String>,
    collection: impl Into<String>,
  ) -> Self {
    Self::Nested {
      parent_collection: parent_collection.into(),
      parent_id: parent_id.into(),
      collection: collection.into(),
    }
  }
}

impl fmt::Display for CollectionPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Root { collection } => f.write_str(collection),
      Self::Nested {
        parent_collection,
        parent_id,
        collection,
      } => write!(f, "{}/{}/{}", parent_collection, parent_id, collection),
    }
  }
}

/// "All documents at `path`", optionally restricted to those whose
/// `field` timestamp is strictly after `after`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaQuery {
  pub path: CollectionPath,
  pub modified_after: Option<ModifiedAfter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedAfter {
  pub field: String,
  pub after: DateTime<Utc>,
}

impl DeltaQuery {
  pub fn full(path: CollectionPath) -> Self {
    Self {
      path,
      modified_after: None,
    }
  }

  /// Delta query on `field` when `since` is set, full fetch otherwise.
  pub fn since(path: CollectionPath, field: &str, since: Option<DateTime<Utc>>) -> Self {
    Self {
      path,
      modified_after: since.map(|after| ModifiedAfter {
        field: field.to_string(),
        after,
      }),
    }
  }

  /// Whether `doc` belongs in this query's result.
  ///
  /// Documents missing the timestamp field never match a delta query.
  pub fn matches(&self, doc: &RemoteDocument) -> bool {
    match &self.modified_after {
      None => true,
      Some(m) => doc.timestamp(&m.field).is_some_and(|ts| ts > m.after),
    }
  }
}

/// A schema-less document: an id plus a bag of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
  pub id: String,
  #[serde(default)]
  pub fields: Map<String, Value>,
}

impl RemoteDocument {
  pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      fields,
    }
  }

  /// Read `field` as a timestamp.
  ///
  /// Accepts RFC 3339 strings, unix milliseconds, and exported timestamp
  /// objects (`{"seconds", "nanoseconds"}` or `{"_seconds", "_nanoseconds"}`).
  pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(self.fields.get(field)?)
  }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
  match value {
    Value::String(s) => DateTime::parse_from_rfc3339(s)
      .ok()
      .map(|dt| dt.with_timezone(&Utc)),
    Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
    Value::Object(obj) => {
      let seconds = obj.get("seconds").or_else(|| obj.get("_seconds"))?.as_i64()?;
      let nanos = obj
        .get("nanoseconds")
        .or_else(|| obj.get("_nanoseconds"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
      Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
    }
    _ => None,
  }
}

/// A remote document store that can answer [`DeltaQuery`]s.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn fetch(&self, query: &DeltaQuery) -> Result<Vec<RemoteDocument>>;
}

/// Remote store held entirely in memory.
///
/// Backs [`SnapshotRemote`](super::snapshot::SnapshotRemote) and tests.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
  collections: RwLock<HashMap<CollectionPath, Vec<RemoteDocument>>>,
}

impl InMemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert or replace (by id) a document at `path`.
  pub fn upsert(&self, path: CollectionPath, doc: RemoteDocument) {
    let mut collections = match self.collections.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let docs = collections.entry(path).or_default();
    match docs.iter_mut().find(|d| d.id == doc.id) {
      Some(existing) => *existing = doc,
      None => docs.push(doc),
    }
  }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
  async fn fetch(&self, query: &DeltaQuery) -> Result<Vec<RemoteDocument>> {
    let collections = match self.collections.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    Ok(
      collections
        .get(&query.path)
        .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
        .unwrap_or_default(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn doc(id: &str, fields: Value) -> RemoteDocument {
    match fields {
      Value::Object(map) => RemoteDocument::new(id, map),
      _ => RemoteDocument::new(id, Map::new()),
    }
  }

  #[test]
  fn test_timestamp_formats() {
    let d = doc(
      "x",
      json!({
        "iso": "2026-01-02T03:04:05Z",
        "millis": 1_767_323_045_000i64,
        "exported": {"_seconds": 1_767_323_045, "_nanoseconds": 0},
        "plain": {"seconds": 1_767_323_045, "nanoseconds": 0},
        "junk": true,
      }),
    );
    let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    assert_eq!(d.timestamp("iso"), Some(expected));
    assert_eq!(d.timestamp("millis"), Some(expected));
    assert_eq!(d.timestamp("exported"), Some(expected));
    assert_eq!(d.timestamp("plain"), Some(expected));
    assert_eq!(d.timestamp("junk"), None);
    assert_eq!(d.timestamp("missing"), None);
  }

  #[tokio::test]
  async fn test_delta_query_filters_strictly_after() {
    let remote = InMemoryRemote::new();
    let w = Utc::now();
    let path = CollectionPath::root("clients");
    remote.upsert(
      path.clone(),
      doc("old", json!({"updatedAt": (w - Duration::hours(1)).to_rfc3339()})),
    );
    remote.upsert(path.clone(), doc("same", json!({"updatedAt": w.to_rfc3339()})));
    remote.upsert(
      path.clone(),
      doc("new", json!({"updatedAt": (w + Duration::hours(1)).to_rfc3339()})),
    );
    remote.upsert(path.clone(), doc("undated", json!({})));

    let all = remote.fetch(&DeltaQuery::full(path.clone())).await.unwrap();
    assert_eq!(all.len(), 4);

    let delta = remote
      .fetch(&DeltaQuery::since(path, "updatedAt", Some(w)))
      .await
      .unwrap();
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].id, "new");
  }

  #[tokio::test]
  async fn test_nested_paths_are_isolated() {
    let remote = InMemoryRemote::new();
    remote.upsert(
      CollectionPath::nested("clients", "c1", "payments"),
      doc("p1", json!({})),
    );

    let c1 = remote
      .fetch(&DeltaQuery::full(CollectionPath::nested(
        "clients", "c1", "payments",
      )))
      .await
      .unwrap();
    let c2 = remote
      .fetch(&DeltaQuery::full(CollectionPath::nested(
        "clients", "c2", "payments",
      )))
      .await
      .unwrap();
    assert_eq!(c1.len(), 1);
    assert!(c2.is_empty());
    assert_eq!(
      CollectionPath::nested("clients", "c1", "payments").to_string(),
      "clients/c1/payments"
    );
  }
}
