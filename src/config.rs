use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::reconcile::CounterRule;

/// Longest geohash whose cells are still distinguishable in `f64` coordinates.
pub const MAX_GEOHASH_PRECISION: usize = 12;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub feed: FeedConfig,
  pub spatial: SpatialConfig,
  pub reconcile: ReconcileConfig,
}

/// Memory-tier bound: a number of entries or a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCapacity {
  Entries(usize),
  Bytes(usize),
}

impl Default for MemoryCapacity {
  fn default() -> Self {
    MemoryCapacity::Entries(512)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub memory_capacity: MemoryCapacity,
  /// Disk entries older than this are treated as absent.
  pub disk_ttl_secs: u64,
  /// Disk tier directory (defaults to `<data dir>/feedsync/cache`)
  pub directory: Option<PathBuf>,
  /// Cache index database (defaults to `<data dir>/feedsync/index.db`)
  pub index_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      memory_capacity: MemoryCapacity::default(),
      disk_ttl_secs: 7 * 24 * 60 * 60,
      directory: None,
      index_path: None,
    }
  }
}

impl CacheConfig {
  pub fn disk_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.disk_ttl_secs.min(i64::MAX as u64) as i64)
  }

  pub fn directory(&self) -> Result<PathBuf> {
    match &self.directory {
      Some(dir) => Ok(dir.clone()),
      None => Ok(data_dir()?.join("cache")),
    }
  }

  pub fn index_path(&self) -> Result<PathBuf> {
    match &self.index_path {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("index.db")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
  pub page_size: usize,
  /// Maximum number of sources fetched concurrently.
  pub fan_out: usize,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      page_size: 20,
      fan_out: 4,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
  /// Re-query when the center moves more than this fraction of the visible span.
  pub move_threshold: f64,
  /// Re-query when the visible span changes by more than this fraction.
  pub zoom_threshold: f64,
  /// Finest geohash precision used for queries. See [`SpatialConfig::precision`].
  pub precision: usize,
  /// Most documents a single viewport query may read from the backend.
  pub scan_limit: usize,
  /// Upper bound on entities returned per viewport.
  pub result_cap: usize,
  /// Document fields holding the geohash and coordinates.
  pub geohash_field: String,
  pub lat_field: String,
  pub lng_field: String,
}

impl Default for SpatialConfig {
  fn default() -> Self {
    Self {
      move_threshold: 0.2,
      zoom_threshold: 0.3,
      precision: 6,
      scan_limit: 1000,
      result_cap: 200,
      geohash_field: "geohash".to_string(),
      lat_field: "lat".to_string(),
      lng_field: "lng".to_string(),
    }
  }
}

impl SpatialConfig {
  /// Configured precision limited to what a geohash can express.
  pub fn precision(&self) -> usize {
    self.precision.clamp(1, MAX_GEOHASH_PRECISION)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
  pub interval_secs: u64,
  /// Collection whose documents carry the counters.
  pub collection: String,
  /// Entities examined per run.
  pub batch_size: usize,
  pub counters: Vec<CounterRule>,
}

impl Default for ReconcileConfig {
  fn default() -> Self {
    Self {
      interval_secs: 15 * 60,
      collection: "posts".to_string(),
      batch_size: 50,
      counters: Vec::new(),
    }
  }
}

impl ReconcileConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

/// `<platform data dir>/feedsync`, home of the cache, index and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| Error::Storage("could not determine data directory".into()))?;
  Ok(data_dir.join("feedsync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedsync/config.yaml
  ///
  /// Without a file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Storage(format!(
          "config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::storage(&format!("read config file {}", path.display()), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::storage(&format!("parse config file {}", path.display()), e))
  }

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }
}
