//! Public entry point for dashboard data.
//!
//! Owns the sync engine and the ephemeral cache. Concurrent
//! `load_dashboard_data` calls share one in-flight pass, and `clear_cache`
//! cancels that pass before wiping the mirror.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::records::{Payment, DASHBOARD_SCHEMA, PAYMENTS};
use crate::cache::{EphemeralCache, PersistentStore, StoreLocation, EPHEMERAL_SCHEMA};
use crate::config::Config;
use crate::sync::{DashboardData, RemoteStore, SyncEngine};

type PassResult = std::result::Result<Arc<DashboardData>, Arc<Report>>;
type PassFuture = Shared<BoxFuture<'static, PassResult>>;

struct InFlight {
  id: u64,
  pass: PassFuture,
  cancel: CancellationToken,
}

#[derive(Default)]
struct PassSlot {
  next_id: u64,
  current: Option<InFlight>,
}

/// Outcome of a refresh, phrased for the UI.
#[derive(Debug, Clone)]
pub enum DashboardLoad {
  /// The pass completed
  Fresh(DashboardData),
  /// The pass failed but an earlier mirror is available
  Stale { data: DashboardData, error: String },
  /// The pass failed and there is nothing to show
  Unavailable { error: String },
}

impl DashboardLoad {
  pub fn data(&self) -> Option<&DashboardData> {
    match self {
      DashboardLoad::Fresh(data) | DashboardLoad::Stale { data, .. } => Some(data),
      DashboardLoad::Unavailable { .. } => None,
    }
  }

  pub fn user_message(&self) -> Option<&'static str> {
    match self {
      DashboardLoad::Fresh(_) => None,
      DashboardLoad::Stale { .. } => Some("could not refresh, showing last known data"),
      DashboardLoad::Unavailable { .. } => Some("could not load"),
    }
  }
}

pub struct CacheCoordinator {
  engine: Arc<SyncEngine>,
  ephemeral: EphemeralCache,
  slot: Mutex<PassSlot>,
  /// Held for a whole clear; passes are only started while holding it
  reset_gate: tokio::sync::Mutex<()>,
}

impl CacheCoordinator {
  pub fn new(engine: SyncEngine, ephemeral: EphemeralCache) -> Self {
    Self {
      engine: Arc::new(engine),
      ephemeral,
      slot: Mutex::new(PassSlot::default()),
      reset_gate: tokio::sync::Mutex::new(()),
    }
  }

  /// Build a coordinator over the tenant databases named by `config`.
  pub fn open(config: &Config, remote: Arc<dyn RemoteStore>) -> Result<Self> {
    let store = PersistentStore::new(StoreLocation::File(config.dashboard_db()?), DASHBOARD_SCHEMA);
    let ephemeral = EphemeralCache::new(PersistentStore::new(
      StoreLocation::File(config.ephemeral_db()?),
      EPHEMERAL_SCHEMA,
    ));
    let engine = SyncEngine::new(store, remote, config.sync.settings());

    Ok(Self::new(engine, ephemeral))
  }

  pub fn ephemeral(&self) -> &EphemeralCache {
    &self.ephemeral
  }

  pub fn store(&self) -> &PersistentStore {
    self.engine.store()
  }

  /// Sync the mirror and return its full contents.
  ///
  /// Joins the pass already in flight, if any. Waits for a running
  /// [`clear_cache`](Self::clear_cache) to finish before starting one.
  pub async fn load_dashboard_data(&self) -> Result<DashboardData> {
    let (id, pass) = {
      let _gate = self.reset_gate.lock().await;
      self.join_or_start()?
    };
    let result = pass.await;
    self.settle(id);

    match result {
      Ok(data) => Ok(data.as_ref().clone()),
      Err(e) => Err(eyre!("{:#}", e)),
    }
  }

  /// Like [`load_dashboard_data`](Self::load_dashboard_data), but falls
  /// back to the local mirror when the pass fails.
  pub async fn refresh(&self) -> DashboardLoad {
    let error = match self.load_dashboard_data().await {
      Ok(data) => return DashboardLoad::Fresh(data),
      Err(e) => e.to_string(),
    };
    warn!(error = %error, "Dashboard refresh failed");

    match self.engine.read_mirror().await {
      Ok(data) if data.cache_hit || !data.clients.is_empty() => {
        DashboardLoad::Stale { data, error }
      }
      Ok(_) => DashboardLoad::Unavailable { error },
      Err(e) => {
        warn!(error = %e, "Local mirror unreadable");
        DashboardLoad::Unavailable { error }
      }
    }
  }

  /// Mirror contents without syncing.
  pub async fn cached_data(&self) -> Result<DashboardData> {
    self.engine.read_mirror().await
  }

  /// Payments of one client, from the local index.
  pub async fn payments_for_client(&self, client_id: &str) -> Result<Vec<Payment>> {
    self
      .engine
      .store()
      .get_all_by_index::<Payment>("clientId", client_id)
      .await
      .map_err(|e| eyre!("Failed to read {} for {}: {}", PAYMENTS, client_id, e))
  }

  /// Drop every mirrored record and the watermark.
  ///
  /// A pass in flight is cancelled and awaited first, so it cannot write
  /// into the freshly cleared store. Loads arriving meanwhile wait for the
  /// reset and then start a cold pass.
  pub async fn clear_cache(&self) -> Result<()> {
    let _gate = self.reset_gate.lock().await;

    let in_flight = self.lock_slot()?.current.take();
    if let Some(in_flight) = in_flight {
      debug!(pass = in_flight.id, "Cancelling in-flight sync pass");
      in_flight.cancel.cancel();
      let _ = in_flight.pass.await;
    }

    self.engine.reset().await
  }

  fn join_or_start(&self) -> Result<(u64, PassFuture)> {
    let mut slot = self.lock_slot()?;

    if let Some(in_flight) = &slot.current {
      debug!(pass = in_flight.id, "Joining in-flight sync pass");
      return Ok((in_flight.id, in_flight.pass.clone()));
    }

    let id = slot.next_id;
    slot.next_id += 1;

    let cancel = CancellationToken::new();
    let engine = Arc::clone(&self.engine);
    let token = cancel.clone();
    let pass = async move {
      engine
        .run_pass(&token)
        .await
        .map(Arc::new)
        .map_err(Arc::new)
    }
    .boxed()
    .shared();

    slot.current = Some(InFlight {
      id,
      pass: pass.clone(),
      cancel,
    });
    Ok((id, pass))
  }

  /// Forget pass `id` once it has finished.
  fn settle(&self, id: u64) {
    match self.slot.lock() {
      Ok(mut slot) => {
        if slot.current.as_ref().is_some_and(|p| p.id == id) {
          slot.current = None;
        }
      }
      Err(e) => warn!(error = %e, "Sync pass slot poisoned"),
    }
  }

  fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, PassSlot>> {
    self.slot.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
