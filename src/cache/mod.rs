//! Generic tiered cache for remote entities.
//!
//! This module provides an entity-agnostic caching mechanism that:
//! - Keeps hot entries in a bounded LRU memory tier
//! - Persists every entry to a content-addressed disk tier with a TTL
//! - Tracks entries in an advisory SQLite index that survives restarts
//! - Serves reads through a single-flight fetcher with offline fallback

mod disk;
mod index;
mod layer;
mod memory;
mod tiered;
mod traits;

pub use disk::DiskTier;
pub use index::{CacheIndex, IndexRecord, TierStats};
pub use layer::CachedFetcher;
pub use tiered::{CacheStats, MemoryWrite, TieredCache};
pub use traits::{disk_hash, CacheEntry, CacheKey, CacheResult, CacheSource, Cacheable, Tier};
