//! Volatile memory tier with strict LRU eviction.

use chrono::Utc;
use lru::LruCache;

use super::traits::{CacheEntry, Tier};
use crate::config::MemoryCapacity;

/// LRU map bounded by entry count or byte budget.
///
/// The underlying [`LruCache`] is unbounded; capacity is enforced here so a
/// byte budget evicts the same way an entry count does.
pub(crate) struct MemoryTier<T> {
  capacity: MemoryCapacity,
  entries: LruCache<String, CacheEntry<T>>,
  bytes: usize,
}

impl<T: Clone> MemoryTier<T> {
  pub fn new(capacity: MemoryCapacity) -> Self {
    Self {
      capacity,
      entries: LruCache::unbounded(),
      bytes: 0,
    }
  }

  /// Look up and mark as most recently used.
  pub fn get(&mut self, id: &str) -> Option<CacheEntry<T>> {
    let entry = self.entries.get_mut(id)?;
    entry.last_access = Utc::now();
    Some(entry.clone())
  }

  /// Look up without touching recency.
  pub fn peek(&self, id: &str) -> Option<&CacheEntry<T>> {
    self.entries.peek(id)
  }

  /// Insert (or replace) an entry as most recently used, then evict down to
  /// capacity. Returns the ids evicted.
  pub fn insert(&mut self, mut entry: CacheEntry<T>) -> Vec<String> {
    entry.tier = Tier::Memory;
    entry.last_access = Utc::now();
    self.bytes += entry.size;
    if let Some(replaced) = self.entries.put(entry.key.id.clone(), entry) {
      self.bytes = self.bytes.saturating_sub(replaced.size);
    }
    self.evict_to_capacity()
  }

  pub fn remove(&mut self, id: &str) -> Option<CacheEntry<T>> {
    let entry = self.entries.pop(id)?;
    self.bytes = self.bytes.saturating_sub(entry.size);
    Some(entry)
  }

  pub fn over_capacity(&self) -> bool {
    match self.capacity {
      MemoryCapacity::Entries(max) => self.entries.len() > max,
      MemoryCapacity::Bytes(max) => self.bytes > max,
    }
  }

  /// Drop least recently used entries until the tier fits its capacity.
  pub fn evict_to_capacity(&mut self) -> Vec<String> {
    let mut evicted = Vec::new();
    while self.over_capacity() {
      let Some((id, entry)) = self.entries.pop_lru() else {
        break;
      };
      self.bytes = self.bytes.saturating_sub(entry.size);
      evicted.push(id);
    }
    evicted
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.bytes = 0;
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn bytes(&self) -> usize {
    self.bytes
  }

  /// Ids from least to most recently used.
  #[cfg(test)]
  pub fn ids_by_recency(&self) -> Vec<String> {
    self.entries.iter().rev().map(|(id, _)| id.clone()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheKey;

  fn entry(id: &str, size: usize) -> CacheEntry<String> {
    CacheEntry {
      value: id.to_uppercase(),
      key: CacheKey {
        id: id.to_string(),
        version: None,
      },
      tier: Tier::Memory,
      last_access: Utc::now(),
      size,
    }
  }

  #[test]
  fn test_insert_beyond_entry_capacity_evicts_oldest() {
    let mut tier = MemoryTier::new(MemoryCapacity::Entries(3));
    assert!(tier.insert(entry("1", 1)).is_empty());
    assert!(tier.insert(entry("2", 1)).is_empty());
    assert!(tier.insert(entry("3", 1)).is_empty());

    let evicted = tier.insert(entry("4", 1));
    assert_eq!(evicted, vec!["1".to_string()]);
    assert!(tier.peek("1").is_none());
    assert_eq!(tier.len(), 3);
  }

  #[test]
  fn test_get_refreshes_recency() {
    let mut tier = MemoryTier::new(MemoryCapacity::Entries(2));
    tier.insert(entry("a", 1));
    tier.insert(entry("b", 1));
    assert_eq!(tier.get("a").unwrap().value, "A");

    let evicted = tier.insert(entry("c", 1));
    assert_eq!(evicted, vec!["b".to_string()]);
    assert_eq!(tier.ids_by_recency(), vec!["a".to_string(), "c".to_string()]);
  }

  #[test]
  fn test_byte_budget_is_respected() {
    let mut tier = MemoryTier::new(MemoryCapacity::Bytes(100));
    tier.insert(entry("a", 40));
    tier.insert(entry("b", 40));
    let evicted = tier.insert(entry("c", 40));
    assert_eq!(evicted, vec!["a".to_string()]);
    assert_eq!(tier.bytes(), 80);
    assert!(!tier.over_capacity());
  }

  #[test]
  fn test_replacing_entry_updates_size() {
    let mut tier = MemoryTier::new(MemoryCapacity::Bytes(100));
    tier.insert(entry("a", 40));
    tier.insert(entry("a", 10));
    assert_eq!(tier.len(), 1);
    assert_eq!(tier.bytes(), 10);
  }

  #[test]
  fn test_oversized_entry_does_not_stick() {
    let mut tier = MemoryTier::new(MemoryCapacity::Bytes(10));
    let evicted = tier.insert(entry("huge", 50));
    assert_eq!(evicted, vec!["huge".to_string()]);
    assert_eq!(tier.len(), 0);
    assert_eq!(tier.bytes(), 0);
  }
}
