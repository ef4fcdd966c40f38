//! Remote store backed by a JSON export of the document database.
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "clients": [
//!     {
//!       "id": "c1",
//!       "fields": { "name": "Anna", "updatedAt": "2026-01-02T03:04:05Z" },
//!       "subcollections": {
//!         "payments": [ { "id": "p1", "fields": { "amount": 50 } } ]
//!       }
//!     }
//!   ]
//! }
//! ```

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::remote::{CollectionPath, DeltaQuery, InMemoryRemote, RemoteDocument, RemoteStore};

#[derive(Debug, Deserialize)]
struct SnapshotDocument {
  id: String,
  #[serde(default)]
  fields: Map<String, Value>,
  #[serde(default)]
  subcollections: HashMap<String, Vec<RemoteDocument>>,
}

/// Read-only remote loaded once from a snapshot file.
pub struct SnapshotRemote {
  inner: InMemoryRemote,
}

impl SnapshotRemote {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read snapshot {}: {}", path.display(), e))?;
    Self::from_json(&contents)
      .map_err(|e| eyre!("Failed to parse snapshot {}: {}", path.display(), e))
  }

  pub fn from_json(contents: &str) -> Result<Self> {
    let collections: HashMap<String, Vec<SnapshotDocument>> = serde_json::from_str(contents)?;

    let inner = InMemoryRemote::new();
    let mut documents = 0usize;
    for (collection, docs) in collections {
      for doc in docs {
        for (sub, children) in doc.subcollections {
          for child in children {
            inner.upsert(CollectionPath::nested(&collection, &doc.id, &sub), child);
            documents += 1;
          }
        }
        inner.upsert(
          CollectionPath::root(&collection),
          RemoteDocument::new(doc.id, doc.fields),
        );
        documents += 1;
      }
    }

    info!(documents, "Loaded remote snapshot");
    Ok(Self { inner })
  }
}

#[async_trait]
impl RemoteStore for SnapshotRemote {
  async fn fetch(&self, query: &DeltaQuery) -> Result<Vec<RemoteDocument>> {
    self.inner.fetch(query).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SNAPSHOT: &str = r#"{
    "clients": [
      {
        "id": "c1",
        "fields": { "name": "Anna", "updatedAt": "2026-01-02T03:04:05Z" },
        "subcollections": {
          "payments": [
            { "id": "p1", "fields": { "amount": 50 } },
            { "id": "p2", "fields": { "amount": "20.5" } }
          ]
        }
      },
      { "id": "c2" }
    ]
  }"#;

  #[tokio::test]
  async fn test_loads_collections_and_subcollections() {
    let remote = SnapshotRemote::from_json(SNAPSHOT).unwrap();

    let clients = remote
      .fetch(&DeltaQuery::full(CollectionPath::root("clients")))
      .await
      .unwrap();
    assert_eq!(clients.len(), 2);

    let payments = remote
      .fetch(&DeltaQuery::full(CollectionPath::nested(
        "clients", "c1", "payments",
      )))
      .await
      .unwrap();
    assert_eq!(payments.len(), 2);
  }

  #[test]
  fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SnapshotRemote::load(&dir.path().join("nope.json")).is_err());
  }
}
