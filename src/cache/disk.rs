//! Persistent, content-addressed disk tier.
//!
//! Each entry lives in `<dir>/<sha256>.json` as a JSON envelope. Writes go to a
//! temporary file in the same directory and are renamed into place, so readers
//! never observe a partially written entry.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const ENTRY_EXT: &str = "json";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// On-disk envelope around a cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DiskRecord<T> {
  pub entity_type: String,
  pub id: String,
  pub version: Option<String>,
  pub stored_at: DateTime<Utc>,
  pub value: T,
}

/// Outcome of a disk read.
#[derive(Debug)]
pub(crate) enum DiskRead<T> {
  Hit(DiskRecord<T>),
  Miss,
  /// Entry was older than the TTL and has been removed.
  Expired,
  /// Entry could not be decoded and has been removed.
  Corrupt,
}

/// Directory of hashed cache files.
#[derive(Debug, Clone)]
pub struct DiskTier {
  dir: PathBuf,
  ttl: Duration,
}

impl DiskTier {
  /// Open (creating if needed) a disk tier rooted at `dir`.
  pub async fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
    let dir = dir.into();
    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(|e| Error::storage(&format!("create cache dir {}", dir.display()), e))?;
    Ok(Self { dir, ttl })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn path_for(&self, hash: &str) -> PathBuf {
    self.dir.join(format!("{}.{}", hash, ENTRY_EXT))
  }

  pub fn is_expired(&self, stored_at: DateTime<Utc>) -> bool {
    Utc::now() - stored_at > self.ttl
  }

  /// Read the entry stored under `hash`.
  ///
  /// Undecodable and expired entries are deleted on the spot; neither is
  /// reported as an error.
  pub(crate) async fn read<T: DeserializeOwned>(&self, hash: &str, id: &str) -> DiskRead<T> {
    let path = self.path_for(hash);
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => return DiskRead::Miss,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "disk cache read failed");
        return DiskRead::Miss;
      }
    };

    let record: DiskRecord<T> = match serde_json::from_slice(&bytes) {
      Ok(record) => record,
      Err(e) => {
        self.discard_corrupt(&path, &e.to_string()).await;
        return DiskRead::Corrupt;
      }
    };

    if record.id != id {
      self
        .discard_corrupt(&path, &format!("entry belongs to {}", record.id))
        .await;
      return DiskRead::Corrupt;
    }

    if self.is_expired(record.stored_at) {
      debug!(id, "disk cache entry expired");
      self.remove_file(&path).await;
      return DiskRead::Expired;
    }

    DiskRead::Hit(record)
  }

  /// Write `record` under `hash` atomically. Returns the number of bytes written.
  pub(crate) async fn write<T: Serialize>(&self, hash: &str, record: &DiskRecord<T>) -> Result<usize> {
    let bytes = serde_json::to_vec(record).map_err(|e| Error::storage("encode cache entry", e))?;
    let target = self.path_for(hash);
    let temp = self.dir.join(format!(
      ".{}.{}.{}.tmp",
      hash,
      std::process::id(),
      TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = tokio::fs::write(&temp, &bytes).await {
      self.remove_file(&temp).await;
      return Err(Error::storage("write cache entry", e));
    }
    if let Err(e) = tokio::fs::rename(&temp, &target).await {
      self.remove_file(&temp).await;
      return Err(Error::storage("publish cache entry", e));
    }
    Ok(bytes.len())
  }

  pub async fn remove(&self, hash: &str) {
    self.remove_file(&self.path_for(hash)).await;
  }

  pub async fn exists(&self, hash: &str) -> bool {
    tokio::fs::try_exists(self.path_for(hash)).await.unwrap_or(false)
  }

  /// Delete every entry file and leftover temp file. Returns the number removed.
  pub async fn clear(&self) -> Result<usize> {
    let mut removed = 0;
    let mut dir = tokio::fs::read_dir(&self.dir).await?;
    while let Some(item) = dir.next_entry().await? {
      let path = item.path();
      let name = item.file_name();
      let name = name.to_string_lossy();
      let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXT);
      if is_entry || name.ends_with(".tmp") {
        self.remove_file(&path).await;
        removed += 1;
      }
    }
    Ok(removed)
  }

  async fn discard_corrupt(&self, path: &Path, reason: &str) {
    let err = Error::CorruptLocalState {
      path: path.display().to_string(),
      reason: reason.to_string(),
    };
    warn!(error = %err, "discarding corrupt disk cache entry");
    self.remove_file(path).await;
  }

  async fn remove_file(&self, path: &Path) {
    match tokio::fs::remove_file(path).await {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::NotFound => {}
      Err(e) => warn!(path = %path.display(), error = %e, "failed to remove disk cache file"),
    }
  }
}
