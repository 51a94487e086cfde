//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Trait for entities that can be cached.
///
/// Implementors provide the remote identifier they are fetched by and,
/// optionally, a version used to tell refreshed copies apart.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Remote identifier for this entity (e.g., a document path)
  fn cache_key(&self) -> String;

  /// Version or content hash of this copy, if the entity tracks one.
  fn version(&self) -> Option<String>;

  /// Entity type name for storage organization (e.g., "document", "counter")
  fn entity_type() -> &'static str;

  /// Approximate in-memory footprint, used by byte-budgeted memory tiers.
  fn size_estimate(&self) -> usize {
    serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
  }
}

/// Composite key of a cache entry: entity id plus the version it was stored at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub id: String,
  pub version: Option<String>,
}

impl CacheKey {
  pub fn of<T: Cacheable>(value: &T) -> Self {
    Self {
      id: value.cache_key(),
      version: value.version(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.version {
      Some(v) => write!(f, "{}@{}", self.id, v),
      None => f.write_str(&self.id),
    }
  }
}

/// Stable disk name for an entity: SHA-256 of type and remote id.
///
/// Hashing the identifier rather than a fetch URL keeps entries valid when
/// the URLs that serve them rotate.
pub fn disk_hash(entity_type: &str, id: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(entity_type.as_bytes());
  hasher.update(b":");
  hasher.update(id.as_bytes());
  hex::encode(hasher.finalize())
}

/// Which tier holds (or served) an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  Memory,
  Disk,
}

impl Tier {
  pub fn as_str(&self) -> &'static str {
    match self {
      Tier::Memory => "memory",
      Tier::Disk => "disk",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "memory" => Some(Tier::Memory),
      "disk" => Some(Tier::Disk),
      _ => None,
    }
  }
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub key: CacheKey,
  pub tier: Tier,
  pub last_access: DateTime<Utc>,
  pub size: usize,
}

/// Result from a read-through operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from a cache tier.
  pub fn from_tier(data: T, tier: Tier) -> Self {
    Self {
      data,
      source: match tier {
        Tier::Memory => CacheSource::Memory,
        Tier::Disk => CacheSource::Disk,
      },
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from the memory tier
  Memory,
  /// Served from the disk tier (and promoted to memory)
  Disk,
  /// Network failed, serving the cached copy
  Offline,
}
