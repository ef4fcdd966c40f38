use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::sync::SyncSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Tenant whose data is mirrored; each tenant gets its own databases
  pub tenant: Option<String>,
  /// Root for databases and logs (default: $XDG_DATA_HOME/dashcache)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub ephemeral: EphemeralConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
  /// JSON export of the document database
  pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Remote field holding each document's modification time
  pub modified_field: String,
  pub fetch_timeout_secs: u64,
  pub max_concurrent_fetches: usize,
  /// Also mirror each client's calls
  pub calls: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let defaults = SyncSettings::default();
    Self {
      modified_field: defaults.modified_field,
      fetch_timeout_secs: defaults.fetch_timeout.as_secs(),
      max_concurrent_fetches: defaults.max_concurrent_fetches,
      calls: defaults.sync_calls,
    }
  }
}

impl SyncConfig {
  pub fn settings(&self) -> SyncSettings {
    SyncSettings {
      modified_field: self.modified_field.clone(),
      fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
      max_concurrent_fetches: self.max_concurrent_fetches,
      sync_calls: self.calls,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
  pub default_ttl_secs: u64,
}

impl Default for EphemeralConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 300,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dashcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dashcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dashcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Root data directory.
  pub fn data_root(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("dashcache"))
  }

  /// Directory holding this tenant's databases.
  ///
  /// Named by the SHA-256 of the tenant id so any id is a safe path segment.
  pub fn tenant_dir(&self) -> Result<PathBuf> {
    let root = self.data_root()?;
    let tenant = self.tenant.as_deref().unwrap_or("default");

    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    Ok(root.join("tenants").join(hex::encode(hasher.finalize())))
  }

  pub fn dashboard_db(&self) -> Result<PathBuf> {
    Ok(self.tenant_dir()?.join("dashboard.db"))
  }

  pub fn ephemeral_db(&self) -> Result<PathBuf> {
    Ok(self.tenant_dir()?.join("ephemeral.db"))
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.ephemeral.default_ttl_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::from_yaml("tenant: acme\n").unwrap();
    assert_eq!(config.tenant.as_deref(), Some("acme"));
    assert_eq!(config.sync.modified_field, "updatedAt");
    assert_eq!(config.sync.fetch_timeout_secs, 30);
    assert!(!config.sync.calls);
    assert_eq!(config.default_ttl(), Duration::from_secs(300));
  }

  #[test]
  fn test_full_config() {
    let config = Config::from_yaml(
      r#"
tenant: acme
data_dir: /tmp/dash
remote:
  snapshot: export.json
sync:
  modified_field: lastModified
  fetch_timeout_secs: 5
  max_concurrent_fetches: 4
  calls: true
ephemeral:
  default_ttl_secs: 60
"#,
    )
    .unwrap();

    let settings = config.sync.settings();
    assert_eq!(settings.modified_field, "lastModified");
    assert_eq!(settings.fetch_timeout, Duration::from_secs(5));
    assert_eq!(settings.max_concurrent_fetches, 4);
    assert!(settings.sync_calls);
    assert_eq!(config.remote.snapshot, Some(PathBuf::from("export.json")));
    assert_eq!(config.default_ttl(), Duration::from_secs(60));
  }

  #[test]
  fn test_tenants_get_separate_directories() {
    let a = Config {
      tenant: Some("acme".into()),
      data_dir: Some(PathBuf::from("/tmp/dash")),
      ..Config::default()
    };
    let b = Config {
      tenant: Some("globex".into()),
      ..a.clone()
    };

    let dir_a = a.tenant_dir().unwrap();
    assert!(dir_a.starts_with("/tmp/dash/tenants"));
    assert_ne!(dir_a, b.tenant_dir().unwrap());
    assert_eq!(a.dashboard_db().unwrap(), dir_a.join("dashboard.db"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/dashcache.yaml"))).is_err());
  }
}
