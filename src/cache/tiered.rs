//! Memory + disk cache for one entity type.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::disk::{DiskRead, DiskRecord, DiskTier};
use super::index::{CacheIndex, IndexRecord, TierStats};
use super::memory::MemoryTier;
use super::traits::{disk_hash, CacheEntry, CacheKey, Cacheable, Tier};
use crate::config::{CacheConfig, MemoryCapacity};
use crate::error::{Error, Result};
use crate::remote::RemoteStore;

/// Point-in-time view of a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
  pub entity_type: &'static str,
  pub memory_entries: usize,
  pub memory_bytes: usize,
  /// Index rows for this entity type, per tier.
  pub indexed: Vec<TierStats>,
}

/// A memory-tier insert whose index bookkeeping is still outstanding.
#[must_use = "pass to TieredCache::record"]
#[derive(Debug)]
pub struct MemoryWrite {
  record: IndexRecord,
  evicted: Vec<String>,
}

impl MemoryWrite {
  /// Ids pushed out of the memory tier by this write.
  pub fn evicted(&self) -> &[String] {
    &self.evicted
  }
}

/// Two-tier cache: a bounded LRU memory tier in front of a persistent disk tier.
///
/// Every `put` lands in both tiers. Memory evictions leave the disk copy in
/// place, so an evicted entry is still served (and promoted back) from disk
/// until it expires or is invalidated. Disk and index failures are logged and
/// swallowed; callers only ever see a hit or a miss.
pub struct TieredCache<T> {
  memory: Mutex<MemoryTier<T>>,
  disk: DiskTier,
  index: Arc<CacheIndex>,
}

impl<T: Cacheable> TieredCache<T> {
  /// Open the cache for `T` under the configured directory.
  pub async fn open(config: &CacheConfig, index: Arc<CacheIndex>) -> Result<Self> {
    let dir = config.directory()?.join(T::entity_type());
    let disk = DiskTier::open(dir, config.disk_ttl()).await?;
    Ok(Self::new(config.memory_capacity, disk, index).await)
  }

  /// Build a cache from its parts and reconcile the index with what is on disk.
  pub async fn new(capacity: MemoryCapacity, disk: DiskTier, index: Arc<CacheIndex>) -> Self {
    let cache = Self {
      memory: Mutex::new(MemoryTier::new(capacity)),
      disk,
      index,
    };
    cache.recover().await;
    cache
  }

  /// Bring the persisted index in line with reality after a restart: nothing is
  /// in memory any more, and rows whose file disappeared are dropped.
  async fn recover(&self) {
    let entity_type = T::entity_type();
    match self.index.demote_memory(Some(entity_type)) {
      Ok(n) if n > 0 => debug!(entity_type, demoted = n, "demoted memory rows to disk"),
      Ok(_) => {}
      Err(e) => warn!(entity_type, error = %e, "failed to demote cache index rows"),
    }

    let rows = match self.index.entries(Some(entity_type)) {
      Ok(rows) => rows,
      Err(e) => {
        warn!(entity_type, error = %e, "cache index unreadable, discarding it");
        self.advise(self.index.discard(Some(entity_type)).map(|_| ()));
        return;
      }
    };

    let mut dropped = 0;
    for row in rows {
      if !self.disk.exists(&row.disk_hash).await {
        self.advise(self.index.remove(entity_type, &row.key));
        dropped += 1;
      }
    }
    if dropped > 0 {
      info!(entity_type, dropped, "dropped cache index rows without disk entries");
    }
  }

  fn lock_memory(&self) -> MutexGuard<'_, MemoryTier<T>> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Log a failed index operation. The index is advisory, so this never fails
  /// the caller.
  fn advise(&self, result: Result<()>) {
    if let Err(e) = result {
      warn!(entity_type = T::entity_type(), error = %e, "cache index update failed");
    }
  }

  fn hash(id: &str) -> String {
    disk_hash(T::entity_type(), id)
  }

  /// Memory-tier lookup only. Never suspends.
  pub fn get_memory(&self, id: &str) -> Option<T> {
    self.lock_memory().get(id).map(|entry| entry.value)
  }

  /// Whether `id` is currently held in memory (does not affect recency).
  pub fn in_memory(&self, id: &str) -> bool {
    self.lock_memory().peek(id).is_some()
  }

  /// Look up `id`, checking memory then disk. Disk hits are promoted into
  /// memory. The returned entry's `tier` says where it was found.
  pub async fn lookup(&self, id: &str) -> Option<CacheEntry<T>> {
    let entity_type = T::entity_type();

    let hit = self.lock_memory().get(id);
    if let Some(entry) = hit {
      self.advise(self.index.touch(entity_type, id, Tier::Memory, entry.last_access));
      return Some(entry);
    }

    let hash = Self::hash(id);
    match self.disk.read::<T>(&hash, id).await {
      DiskRead::Hit(record) => {
        debug!(entity_type, id, "disk cache hit, promoting");
        let value = record.value;
        let entry = CacheEntry {
          size: value.size_estimate(),
          key: CacheKey {
            id: id.to_string(),
            version: record.version,
          },
          value,
          tier: Tier::Disk,
          last_access: Utc::now(),
        };
        let evicted = self.lock_memory().insert(entry.clone());
        self.advise(self.index.touch(entity_type, id, Tier::Memory, entry.last_access));
        self.demote(&evicted);
        Some(entry)
      }
      DiskRead::Miss => None,
      DiskRead::Expired | DiskRead::Corrupt => {
        self.advise(self.index.remove(entity_type, id));
        None
      }
    }
  }

  /// Look up `id` in memory, then disk.
  pub async fn get(&self, id: &str) -> Option<T> {
    self.lookup(id).await.map(|entry| entry.value)
  }

  /// Store `value` in both tiers under its cache key.
  pub async fn put(&self, value: T) {
    self.put_memory(value.clone());
    self.persist(&value).await;
  }

  /// Store `value` in the memory tier only, making it visible to every reader
  /// immediately. Pair with [`TieredCache::persist`] to make it durable.
  pub fn put_memory(&self, value: T) {
    let write = self.write_memory(value);
    self.record(write);
  }

  /// Insert `value` into the memory tier without touching the index.
  ///
  /// Never suspends and does no I/O, so it may run under a caller's lock.
  /// The returned [`MemoryWrite`] must be passed to [`TieredCache::record`]
  /// once that lock is released.
  pub fn write_memory(&self, value: T) -> MemoryWrite {
    let key = CacheKey::of(&value);
    let entry = CacheEntry {
      size: value.size_estimate(),
      key,
      value,
      tier: Tier::Memory,
      last_access: Utc::now(),
    };
    let now = entry.last_access;
    let record = IndexRecord {
      entity_type: T::entity_type().to_string(),
      disk_hash: Self::hash(&entry.key.id),
      key: entry.key.id.clone(),
      tier: Tier::Memory,
      size: entry.size,
      version: entry.key.version.clone(),
      stored_at: now,
      last_access: now,
    };
    let evicted = self.lock_memory().insert(entry);
    MemoryWrite { record, evicted }
  }

  /// Bring the index up to date with a memory write.
  pub fn record(&self, write: MemoryWrite) {
    self.advise(self.index.record(&write.record));
    self.demote(&write.evicted);
  }

  /// Best-effort write of `value` to the disk tier.
  pub async fn persist(&self, value: &T) {
    let id = value.cache_key();
    let record = DiskRecord {
      entity_type: T::entity_type().to_string(),
      id: id.clone(),
      version: value.version(),
      stored_at: Utc::now(),
      value: value.clone(),
    };
    if let Err(e) = self.disk.write(&Self::hash(&id), &record).await {
      warn!(entity_type = T::entity_type(), id, error = %e, "disk cache write failed");
    }
  }

  /// Record that evicted ids now live on disk only.
  fn demote(&self, evicted: &[String]) {
    let now = Utc::now();
    for id in evicted {
      debug!(entity_type = T::entity_type(), id, "evicted from memory");
      self.advise(self.index.touch(T::entity_type(), id, Tier::Disk, now));
    }
  }

  /// Remove `id` from every tier and the index.
  pub async fn invalidate(&self, id: &str) {
    self.lock_memory().remove(id);
    self.disk.remove(&Self::hash(id)).await;
    self.advise(self.index.remove(T::entity_type(), id));
  }

  /// Remove every entry of this entity type (e.g. on logout). Returns the
  /// number of disk entries removed.
  pub async fn invalidate_all(&self) -> usize {
    self.lock_memory().clear();
    let removed = match self.disk.clear().await {
      Ok(n) => n,
      Err(e) => {
        warn!(entity_type = T::entity_type(), error = %e, "failed to clear disk cache");
        0
      }
    };
    self.advise(self.index.discard(Some(T::entity_type())).map(|_| ()));
    info!(entity_type = T::entity_type(), removed, "cache invalidated");
    removed
  }

  /// Evict least recently used memory entries until the tier fits its
  /// capacity. Returns how many were evicted.
  pub fn evict_to_capacity(&self) -> usize {
    let evicted = self.lock_memory().evict_to_capacity();
    self.demote(&evicted);
    evicted.len()
  }

  /// Delete disk entries older than the TTL. Returns the number removed.
  pub async fn purge_expired(&self) -> usize {
    let cutoff = Utc::now() - self.disk.ttl();
    let expired = match self.index.stored_before(Some(T::entity_type()), cutoff) {
      Ok(rows) => rows,
      Err(e) => {
        warn!(entity_type = T::entity_type(), error = %e, "cannot list expired entries");
        return 0;
      }
    };

    for row in &expired {
      self.lock_memory().remove(&row.key);
      self.disk.remove(&row.disk_hash).await;
      self.advise(self.index.remove(T::entity_type(), &row.key));
    }
    if !expired.is_empty() {
      info!(entity_type = T::entity_type(), purged = expired.len(), "purged expired entries");
    }
    expired.len()
  }

  /// Invalidate every indexed entry whose remote id no longer resolves.
  ///
  /// Entries whose check fails for any other reason are kept; a transient
  /// failure is not evidence that the document is gone.
  pub async fn prune_unresolved<S: RemoteStore + ?Sized>(&self, store: &S) -> Result<usize> {
    let rows = self.index.entries(Some(T::entity_type()))?;
    let mut pruned = 0;
    for row in rows {
      match store.get(&row.key).await {
        Ok(_) => {}
        Err(Error::NotFound(_)) => {
          self.invalidate(&row.key).await;
          pruned += 1;
        }
        Err(e) => debug!(id = %row.key, error = %e, "could not resolve cached entry"),
      }
    }
    Ok(pruned)
  }

  pub fn stats(&self) -> CacheStats {
    let (memory_entries, memory_bytes) = {
      let memory = self.lock_memory();
      (memory.len(), memory.bytes())
    };
    let indexed = match self.index.stats() {
      Ok(all) => all
        .into_iter()
        .filter(|s| s.entity_type == T::entity_type())
        .collect(),
      Err(e) => {
        warn!(error = %e, "cache index stats unavailable");
        Vec::new()
      }
    };
    CacheStats {
      entity_type: T::entity_type(),
      memory_entries,
      memory_bytes,
      indexed,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::{Fields, MemoryStore};
  use chrono::Duration;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    id: String,
    body: String,
  }

  impl Cacheable for Note {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn version(&self) -> Option<String> {
      None
    }

    fn entity_type() -> &'static str {
      "note"
    }
  }

  fn note(id: &str) -> Note {
    Note {
      id: id.to_string(),
      body: format!("body of {}", id),
    }
  }

  async fn cache_in(dir: &std::path::Path, capacity: usize) -> TieredCache<Note> {
    let disk = DiskTier::open(dir, Duration::hours(1)).await.unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    TieredCache::new(MemoryCapacity::Entries(capacity), disk, index).await
  }

  #[tokio::test]
  async fn test_put_then_get_returns_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 4).await;

    cache.put(note("1")).await;
    assert_eq!(cache.get("1").await, Some(note("1")));
    assert_eq!(cache.lookup("1").await.unwrap().tier, Tier::Memory);
  }

  #[tokio::test]
  async fn test_capacity_overflow_evicts_oldest_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 3).await;

    for i in 1..=4 {
      cache.put(note(&i.to_string())).await;
    }

    assert!(!cache.in_memory("1"));
    assert!(cache.in_memory("4"));
    assert_eq!(cache.get_memory("1"), None);

    // Falls through to disk and is promoted back.
    let entry = cache.lookup("1").await.unwrap();
    assert_eq!(entry.tier, Tier::Disk);
    assert_eq!(entry.value, note("1"));
    assert!(cache.in_memory("1"));
    // Promotion pushed the next-oldest out.
    assert!(!cache.in_memory("2"));
  }

  #[tokio::test]
  async fn test_invalidate_removes_all_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 4).await;
    cache.put(note("1")).await;

    cache.invalidate("1").await;
    assert_eq!(cache.get("1").await, None);
    assert!(cache.stats().indexed.is_empty());
  }

  #[tokio::test]
  async fn test_corrupt_disk_entry_self_heals() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1).await;
    cache.put(note("1")).await;
    cache.put(note("2")).await; // evicts "1" from memory

    let path = dir.path().join(format!("{}.json", disk_hash("note", "1")));
    std::fs::write(&path, b"garbage").unwrap();

    assert_eq!(cache.get("1").await, None);
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn test_disk_survives_restart_and_index_is_demoted() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    {
      let disk = DiskTier::open(dir.path(), Duration::hours(1)).await.unwrap();
      let cache: TieredCache<Note> =
        TieredCache::new(MemoryCapacity::Entries(4), disk, index.clone()).await;
      cache.put(note("1")).await;
    }

    let disk = DiskTier::open(dir.path(), Duration::hours(1)).await.unwrap();
    let cache: TieredCache<Note> = TieredCache::new(MemoryCapacity::Entries(4), disk, index).await;
    assert!(!cache.in_memory("1"));
    let stats = cache.stats();
    assert_eq!(stats.indexed.len(), 1);
    assert_eq!(stats.indexed[0].tier, Tier::Disk);

    assert_eq!(cache.lookup("1").await.unwrap().tier, Tier::Disk);
  }

  #[tokio::test]
  async fn test_recover_drops_rows_without_files() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    {
      let disk = DiskTier::open(dir.path(), Duration::hours(1)).await.unwrap();
      let cache: TieredCache<Note> =
        TieredCache::new(MemoryCapacity::Entries(4), disk, index.clone()).await;
      cache.put(note("1")).await;
    }
    std::fs::remove_file(dir.path().join(format!("{}.json", disk_hash("note", "1")))).unwrap();

    let disk = DiskTier::open(dir.path(), Duration::hours(1)).await.unwrap();
    let cache: TieredCache<Note> = TieredCache::new(MemoryCapacity::Entries(4), disk, index).await;
    assert!(cache.stats().indexed.is_empty());
  }

  #[tokio::test]
  async fn test_purge_expired() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskTier::open(dir.path(), Duration::zero()).await.unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    let cache: TieredCache<Note> = TieredCache::new(MemoryCapacity::Entries(4), disk, index).await;
    cache.put(note("1")).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    assert_eq!(cache.purge_expired().await, 1);
    assert_eq!(cache.get("1").await, None);
  }

  #[tokio::test]
  async fn test_evict_to_capacity_after_shrinking_values() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskTier::open(dir.path(), Duration::hours(1)).await.unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    let one = note("1").size_estimate();
    let cache: TieredCache<Note> =
      TieredCache::new(MemoryCapacity::Bytes(one * 2), disk, index).await;

    cache.put(note("1")).await;
    cache.put(note("2")).await;
    assert_eq!(cache.evict_to_capacity(), 0);
    assert_eq!(cache.stats().memory_entries, 2);
    assert!(cache.stats().memory_bytes <= one * 2);
  }

  #[tokio::test]
  async fn test_prune_unresolved_invalidates_missing_ids() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 4).await;
    let store = MemoryStore::new();
    store.seed("notes/live", Fields::new());

    cache.put(note("notes/live")).await;
    cache.put(note("notes/gone")).await;

    assert_eq!(cache.prune_unresolved(&store).await.unwrap(), 1);
    assert!(cache.get("notes/live").await.is_some());
    assert!(cache.get("notes/gone").await.is_none());
  }

  #[tokio::test]
  async fn test_memory_write_is_visible_before_indexing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1).await;
    cache.put(note("1")).await;

    let write = cache.write_memory(note("2"));
    assert_eq!(cache.get_memory("2"), Some(note("2")));
    assert_eq!(write.evicted(), ["1".to_string()]);
    assert!(cache.stats().indexed.iter().all(|s| s.tier == Tier::Memory));

    cache.record(write);
    let stats = cache.stats();
    assert!(stats.indexed.iter().any(|s| s.tier == Tier::Disk && s.entries == 1));
    assert!(stats.indexed.iter().any(|s| s.tier == Tier::Memory && s.entries == 1));
  }

  #[tokio::test]
  async fn test_invalidate_all() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 4).await;
    cache.put(note("1")).await;
    cache.put(note("2")).await;

    assert_eq!(cache.invalidate_all().await, 2);
    assert_eq!(cache.get("1").await, None);
    assert_eq!(cache.stats().memory_entries, 0);
  }
}
