use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use dashcache::sync::{InMemoryRemote, SnapshotRemote};
use dashcache::{logging, CacheCoordinator, Config, DashboardLoad, RemoteStore};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dashcache")]
#[command(about = "Local mirror cache for the coaching dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Tenant to operate on
  #[arg(short, long)]
  tenant: Option<String>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one incremental sync pass against the remote snapshot
  Sync {
    /// Remote snapshot to sync from (overrides config)
    #[arg(long)]
    snapshot: Option<PathBuf>,
  },
  /// Show watermark and mirror sizes
  Status,
  /// Drop the mirror and the watermark; the next sync runs cold
  Clear,
  /// Ephemeral TTL cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
  },
  Set {
    key: String,
    /// JSON value (plain text is stored as a string)
    value: String,
    /// Time to live in seconds (default from config)
    #[arg(long)]
    ttl: Option<u64>,
  },
  Delete {
    key: String,
  },
  Stats,
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override tenant if specified on command line
  let config = if let Some(tenant) = args.tenant {
    Config {
      tenant: Some(tenant),
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.data_root()?.join("logs"), args.verbose)?;

  match args.command {
    Command::Sync { snapshot } => {
      let path = snapshot
        .or_else(|| config.remote.snapshot.clone())
        .ok_or_else(|| eyre!("No remote configured. Set remote.snapshot or pass --snapshot."))?;
      let remote: Arc<dyn RemoteStore> = Arc::new(SnapshotRemote::load(&path)?);
      let cache = CacheCoordinator::open(&config, remote)?;

      let load = cache.refresh().await;
      if let Some(message) = load.user_message() {
        eprintln!("{}", message);
      }
      match &load {
        DashboardLoad::Fresh(data) | DashboardLoad::Stale { data, .. } => {
          println!(
            "clients: {}  payments: {}  calls: {}  ({} ms, {})",
            data.clients.len(),
            data.payments.len(),
            data.calls.len(),
            data.load_time_ms,
            if data.cache_hit { "warm" } else { "cold" }
          );
          if data.retrying_parents > 0 {
            println!("{} parents will be retried next sync", data.retrying_parents);
          }
        }
        DashboardLoad::Unavailable { .. } => {}
      }
      if let DashboardLoad::Stale { error, .. } | DashboardLoad::Unavailable { error } = load {
        return Err(eyre!(error));
      }
    }
    Command::Status => {
      let cache = offline_coordinator(&config)?;
      let data = cache.cached_data().await?;
      let watermark = cache
        .store()
        .get_meta(dashcache::cache::WATERMARK_KEY)
        .await?
        .unwrap_or_else(|| "never".to_string());
      let stats = cache.ephemeral().stats().await;

      println!("database:   {}", cache.store().location());
      println!("last sync:  {}", watermark);
      println!("clients:    {}", data.clients.len());
      println!("payments:   {}", data.payments.len());
      println!("calls:      {}", data.calls.len());
      println!("retrying:   {}", data.retrying_parents);
      println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Command::Clear => {
      let cache = offline_coordinator(&config)?;
      cache.clear_cache().await?;
      println!("Dashboard cache cleared");
    }
    Command::Cache(command) => {
      let cache = offline_coordinator(&config)?;
      let ephemeral = cache.ephemeral();

      match command {
        CacheCommand::Get { key } => match ephemeral.get::<Value>(&key).await {
          Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
          None => return Err(eyre!("{}: absent", key)),
        },
        CacheCommand::Set { key, value, ttl } => {
          let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
          let ttl = ttl.map_or_else(|| config.default_ttl(), Duration::from_secs);
          if !ephemeral.set(&key, &value, ttl).await {
            return Err(eyre!("Failed to store {}", key));
          }
        }
        CacheCommand::Delete { key } => {
          if !ephemeral.delete(&key).await {
            return Err(eyre!("Failed to delete {}", key));
          }
        }
        CacheCommand::Stats => {
          println!("{}", serde_json::to_string_pretty(&ephemeral.stats().await)?);
        }
        CacheCommand::Clear => {
          if !ephemeral.clear_all().await {
            return Err(eyre!("Failed to clear ephemeral cache"));
          }
        }
      }
    }
  }

  Ok(())
}

/// Coordinator for commands that only touch local state.
fn offline_coordinator(config: &Config) -> Result<CacheCoordinator> {
  CacheCoordinator::open(config, Arc::new(InMemoryRemote::new()))
}
