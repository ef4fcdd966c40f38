//! Incremental synchronization of the local mirror.
//!
//! One pass:
//! 1. Load the watermark `W` (unset means a cold pass).
//! 2. Fetch primary documents modified after `W` (everything when cold),
//!    merge them, and read the whole primary partition back.
//! 3. For every primary record, fetch its dependent sub-collection bounded
//!    by `W`, concurrently. A failing parent is logged, remembered for the
//!    next pass, and skipped; its siblings still merge.
//! 4. Advance the watermark to the time the pass started.
//!
//! Merges replace whole records by id, so applying the same delta twice
//! leaves the mirror unchanged.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::remote::{CollectionPath, DeltaQuery, RemoteDocument, RemoteStore};
use crate::cache::{CacheRecord, PartitionData, PersistentStore, SyncWatermark};
use crate::dashboard::records::{Call, CallRecord, Client, ClientRecord, Payment, PaymentRecord};

/// Metadata key for parents whose dependents must be re-fetched in full.
pub const RETRY_KEY: &str = "pendingDependents";

/// Partition name -> parent ids.
type RetryList = BTreeMap<String, BTreeSet<String>>;

/// A partition mirrored from a top-level remote collection.
pub trait PrimaryData: PartitionData {
  const COLLECTION: &'static str;

  fn from_remote(doc: RemoteDocument) -> CacheRecord<Self>;
}

/// A partition mirrored from a sub-collection of each primary record.
pub trait DependentData: PartitionData {
  type Parent: PrimaryData;
  const SUBCOLLECTION: &'static str;

  fn from_remote(parent: &CacheRecord<Self::Parent>, doc: RemoteDocument) -> CacheRecord<Self>;
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
  /// Remote field holding each document's modification time
  pub modified_field: String,
  /// Upper bound for a single remote query
  pub fetch_timeout: Duration,
  /// Dependent fetches in flight at once
  pub max_concurrent_fetches: usize,
  /// Also mirror each client's `calls` sub-collection
  pub sync_calls: bool,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      modified_field: "updatedAt".to_string(),
      fetch_timeout: Duration::from_secs(30),
      max_concurrent_fetches: 16,
      sync_calls: false,
    }
  }
}

/// Full mirror contents after a pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
  pub clients: Vec<Client>,
  pub payments: Vec<Payment>,
  pub calls: Vec<Call>,
  pub load_time_ms: u64,
  /// The pass was warm (a watermark was already set)
  pub cache_hit: bool,
  /// Parents whose dependents could not be fetched this pass
  pub retrying_parents: usize,
}

pub struct SyncEngine {
  store: PersistentStore,
  remote: Arc<dyn RemoteStore>,
  watermark: SyncWatermark,
  settings: SyncSettings,
}

impl SyncEngine {
  pub fn new(store: PersistentStore, remote: Arc<dyn RemoteStore>, settings: SyncSettings) -> Self {
    Self {
      watermark: SyncWatermark::new(store.clone()),
      store,
      remote,
      settings,
    }
  }

  pub fn store(&self) -> &PersistentStore {
    &self.store
  }

  pub fn watermark(&self) -> &SyncWatermark {
    &self.watermark
  }

  /// Run one synchronization pass.
  ///
  /// Local storage errors and primary fetch errors abort the pass without
  /// touching the watermark. Cancellation does the same.
  pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<DashboardData> {
    let started = Instant::now();
    let pass_started_at = Utc::now();

    self.store.open().await?;
    let since = self.watermark.load().await?;
    let mut retries = self.load_retries().await?;
    info!(cold = since.is_none(), watermark = ?since, "Starting sync pass");

    let clients = self.sync_primary::<ClientRecord>(since, cancel).await?;
    let payments = self
      .sync_dependent::<PaymentRecord>(&clients, since, &mut retries, cancel)
      .await?;
    let calls = if self.settings.sync_calls {
      self
        .sync_dependent::<CallRecord>(&clients, since, &mut retries, cancel)
        .await?
    } else {
      self.store.get_all().await?
    };

    ensure_live(cancel)?;
    self.save_retries(&retries).await?;
    self.watermark.advance(pass_started_at).await?;

    let retrying_parents: usize = retries.values().map(BTreeSet::len).sum();
    let load_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(
      clients = clients.len(),
      payments = payments.len(),
      calls = calls.len(),
      retrying_parents,
      load_time_ms,
      "Sync pass complete"
    );

    Ok(DashboardData {
      clients,
      payments,
      calls,
      load_time_ms,
      cache_hit: since.is_some(),
      retrying_parents,
    })
  }

  /// Local mirror contents without contacting the remote.
  pub async fn read_mirror(&self) -> Result<DashboardData> {
    let started = Instant::now();
    let since = self.watermark.load().await?;
    let retrying_parents: usize = self.load_retries().await?.values().map(BTreeSet::len).sum();

    Ok(DashboardData {
      clients: self.store.get_all().await?,
      payments: self.store.get_all().await?,
      calls: self.store.get_all().await?,
      load_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
      cache_hit: since.is_some(),
      retrying_parents,
    })
  }

  /// Wipe every partition and the watermark. The next pass runs cold.
  pub async fn reset(&self) -> Result<()> {
    self.store.clear_all().await?;
    self.watermark.forget().await;
    info!("Dashboard cache cleared");
    Ok(())
  }

  async fn sync_primary<P: PrimaryData>(
    &self,
    since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
  ) -> Result<Vec<CacheRecord<P>>> {
    let query = DeltaQuery::since(
      CollectionPath::root(P::COLLECTION),
      &self.settings.modified_field,
      since,
    );
    let docs = fetch_bounded(
      Arc::clone(&self.remote),
      query,
      self.settings.fetch_timeout,
      cancel.clone(),
    )
    .await?;

    let fetched: Vec<CacheRecord<P>> = docs.into_iter().map(P::from_remote).collect();
    ensure_live(cancel)?;
    self.store.put_many(&fetched).await?;

    let all: Vec<CacheRecord<P>> = self.store.get_all().await?;
    info!(
      partition = P::PARTITION,
      new = fetched.len(),
      total = all.len(),
      "Synced partition"
    );
    Ok(all)
  }

  async fn sync_dependent<D: DependentData>(
    &self,
    parents: &[CacheRecord<D::Parent>],
    since: Option<DateTime<Utc>>,
    retries: &mut RetryList,
    cancel: &CancellationToken,
  ) -> Result<Vec<CacheRecord<D>>> {
    let pending = retries.remove(D::PARTITION).unwrap_or_default();
    if !pending.is_empty() {
      debug!(
        partition = D::PARTITION,
        parents = pending.len(),
        "Re-fetching dependents of previously failed parents"
      );
    }

    let fetches: Vec<_> = parents.iter().map(|parent| {
      // A parent that failed last time is fetched in full
      let bound = if pending.contains(&parent.id) {
        None
      } else {
        since
      };
      let query = DeltaQuery::since(
        CollectionPath::nested(
          <D::Parent as PrimaryData>::COLLECTION,
          &parent.id,
          D::SUBCOLLECTION,
        ),
        &self.settings.modified_field,
        bound,
      );
      let remote = Arc::clone(&self.remote);
      let timeout = self.settings.fetch_timeout;
      let cancel = cancel.clone();
      let parent = parent.clone();

      async move {
        let result = fetch_bounded(remote, query, timeout, cancel)
          .await
          .map(|docs| {
            docs
              .into_iter()
              .map(|doc| D::from_remote(&parent, doc))
              .collect::<Vec<_>>()
          });
        (parent.id, result)
      }
    }).collect();

    let results: Vec<(String, Result<Vec<CacheRecord<D>>>)> = stream::iter(fetches)
      .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
      .collect()
      .await;
    ensure_live(cancel)?;

    let mut fetched = Vec::new();
    let mut failed = BTreeSet::new();
    for (parent_id, result) in results {
      match result {
        Ok(records) => fetched.extend(records),
        Err(e) => {
          warn!(
            partition = D::PARTITION,
            parent = %parent_id,
            error = %e,
            "Skipping dependents for parent"
          );
          failed.insert(parent_id);
        }
      }
    }

    self.store.put_many(&fetched).await?;
    let all: Vec<CacheRecord<D>> = self.store.get_all().await?;
    info!(
      partition = D::PARTITION,
      new = fetched.len(),
      total = all.len(),
      failed = failed.len(),
      "Synced partition"
    );

    if !failed.is_empty() {
      retries.insert(D::PARTITION.to_string(), failed);
    }
    Ok(all)
  }

  async fn load_retries(&self) -> Result<RetryList> {
    match self.store.get_meta(RETRY_KEY).await? {
      Some(raw) => serde_json::from_str(&raw)
        .map_err(|e| eyre!("Failed to parse dependent retry list: {}", e)),
      None => Ok(RetryList::new()),
    }
  }

  async fn save_retries(&self, retries: &RetryList) -> Result<()> {
    let raw = serde_json::to_string(retries)
      .map_err(|e| eyre!("Failed to serialize dependent retry list: {}", e))?;
    self.store.put_meta(RETRY_KEY, &raw).await
  }
}

/// One remote query, bounded by `timeout` and abandoned on cancellation.
async fn fetch_bounded(
  remote: Arc<dyn RemoteStore>,
  query: DeltaQuery,
  timeout: Duration,
  cancel: CancellationToken,
) -> Result<Vec<RemoteDocument>> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(eyre!("Sync pass cancelled")),
    result = tokio::time::timeout(timeout, remote.fetch(&query)) => match result {
      Ok(Ok(docs)) => {
        debug!(path = %query.path, documents = docs.len(), "Fetched remote documents");
        Ok(docs)
      }
      Ok(Err(e)) => Err(eyre!("Failed to fetch {}: {}", query.path, e)),
      Err(_) => Err(eyre!("Fetch of {} timed out after {:?}", query.path, timeout)),
    },
  }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
  if cancel.is_cancelled() {
    Err(eyre!("Sync pass cancelled"))
  } else {
    Ok(())
  }
}
