//! Persisted cache index (SQLite).
//!
//! Tracks which entries exist, in which tier, how large they are and when they
//! were last touched. The index is advisory: the cache stays correct if it is
//! deleted, it only loses the ability to sweep and report on old entries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::Tier;
use crate::error::{Error, Result};

/// One row of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
  pub entity_type: String,
  pub key: String,
  pub disk_hash: String,
  pub tier: Tier,
  pub size: usize,
  pub version: Option<String>,
  pub stored_at: DateTime<Utc>,
  pub last_access: DateTime<Utc>,
}

/// Entry counts and bytes for one entity type and tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierStats {
  pub entity_type: String,
  pub tier: Tier,
  pub entries: usize,
  pub bytes: usize,
}

/// SQLite-backed cache index.
pub struct CacheIndex {
  conn: Mutex<Connection>,
}

/// Schema for the index table.
const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_index (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    disk_hash TEXT NOT NULL,
    tier TEXT NOT NULL,
    size INTEGER NOT NULL,
    version TEXT,
    stored_at TEXT NOT NULL,
    last_access TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_index_stored
    ON cache_index(entity_type, stored_at);
"#;

const SELECT_COLUMNS: &str =
  "entity_type, entity_key, disk_hash, tier, size, version, stored_at, last_access";

impl CacheIndex {
  /// Open or create the index at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::storage("create index directory", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| Error::storage(&format!("open cache index at {}", path.display()), e))?;
    Self::with_connection(conn)
  }

  /// Index that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(INDEX_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Default index location under the user's data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("could not determine data directory".into()))?;

    Ok(data_dir.join("feedsync").join("index.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("index lock poisoned: {}", e)))
  }

  /// Insert or replace a row.
  pub fn record(&self, rec: &IndexRecord) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_index
         (entity_type, entity_key, disk_hash, tier, size, version, stored_at, last_access)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        rec.entity_type,
        rec.key,
        rec.disk_hash,
        rec.tier.as_str(),
        rec.size as i64,
        rec.version,
        rec.stored_at.to_rfc3339(),
        rec.last_access.to_rfc3339(),
      ],
    )?;
    Ok(())
  }

  /// Update tier and last-access of an existing row.
  pub fn touch(&self, entity_type: &str, key: &str, tier: Tier, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE cache_index SET tier = ?, last_access = ?
       WHERE entity_type = ? AND entity_key = ?",
      params![tier.as_str(), at.to_rfc3339(), entity_type, key],
    )?;
    Ok(())
  }

  pub fn remove(&self, entity_type: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM cache_index WHERE entity_type = ? AND entity_key = ?",
      params![entity_type, key],
    )?;
    Ok(())
  }

  pub fn get(&self, entity_type: &str, key: &str) -> Result<Option<IndexRecord>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM cache_index WHERE entity_type = ? AND entity_key = ?",
      SELECT_COLUMNS
    );
    let row = conn
      .query_row(&sql, params![entity_type, key], read_row)
      .optional()?;
    Ok(row.and_then(|r| r.ok()))
  }

  /// All rows, optionally restricted to one entity type, oldest access first.
  pub fn entries(&self, entity_type: Option<&str>) -> Result<Vec<IndexRecord>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM cache_index
       WHERE (?1 IS NULL OR entity_type = ?1)
       ORDER BY last_access",
      SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(params![entity_type], read_row)?
      .filter_map(|r| r.ok())
      .filter_map(|r| r.ok())
      .collect();
    Ok(rows)
  }

  /// Rows stored before `cutoff`.
  pub fn stored_before(
    &self,
    entity_type: Option<&str>,
    cutoff: DateTime<Utc>,
  ) -> Result<Vec<IndexRecord>> {
    Ok(
      self
        .entries(entity_type)?
        .into_iter()
        .filter(|r| r.stored_at < cutoff)
        .collect(),
    )
  }

  /// Mark every memory-tier row as disk-only. Called on startup since the
  /// memory tier does not survive a restart.
  pub fn demote_memory(&self, entity_type: Option<&str>) -> Result<usize> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "UPDATE cache_index SET tier = 'disk'
       WHERE tier = 'memory' AND (?1 IS NULL OR entity_type = ?1)",
      params![entity_type],
    )?;
    Ok(changed)
  }

  /// Drop rows, optionally for one entity type only. Returns the number dropped.
  pub fn discard(&self, entity_type: Option<&str>) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_index WHERE (?1 IS NULL OR entity_type = ?1)",
      params![entity_type],
    )?;
    Ok(removed)
  }

  /// Entry counts and bytes grouped by entity type and tier.
  pub fn stats(&self) -> Result<Vec<TierStats>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT entity_type, tier, COUNT(*), COALESCE(SUM(size), 0)
       FROM cache_index
       GROUP BY entity_type, tier
       ORDER BY entity_type, tier",
    )?;
    let rows = stmt
      .query_map([], |row| {
        let tier: String = row.get(1)?;
        let entries: i64 = row.get(2)?;
        let bytes: i64 = row.get(3)?;
        Ok((row.get::<_, String>(0)?, tier, entries, bytes))
      })?
      .filter_map(|r| r.ok())
      .filter_map(|(entity_type, tier, entries, bytes)| {
        Some(TierStats {
          entity_type,
          tier: Tier::parse(&tier)?,
          entries: entries.max(0) as usize,
          bytes: bytes.max(0) as usize,
        })
      })
      .collect();
    Ok(rows)
  }
}

/// Decode a row. The outer result is SQLite's; the inner one reports rows whose
/// contents no longer parse, which callers skip.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<IndexRecord>> {
  let entity_type: String = row.get(0)?;
  let key: String = row.get(1)?;
  let disk_hash: String = row.get(2)?;
  let tier: String = row.get(3)?;
  let size: i64 = row.get(4)?;
  let version: Option<String> = row.get(5)?;
  let stored_at: String = row.get(6)?;
  let last_access: String = row.get(7)?;

  let decoded = (|| {
    let tier = Tier::parse(&tier).ok_or_else(|| format!("unknown tier {}", tier))?;
    let stored_at = parse_datetime(&stored_at)?;
    let last_access = parse_datetime(&last_access)?;
    Ok::<_, String>((tier, stored_at, last_access))
  })();

  Ok(match decoded {
    Ok((tier, stored_at, last_access)) => Ok(IndexRecord {
      entity_type,
      key,
      disk_hash,
      tier,
      size: size.max(0) as usize,
      version,
      stored_at,
      last_access,
    }),
    Err(reason) => {
      let err = Error::CorruptLocalState {
        path: format!("cache_index/{}/{}", entity_type, key),
        reason,
      };
      warn!(error = %err, "skipping unreadable cache index row");
      Err(err)
    }
  })
}

/// Parse an RFC 3339 timestamp as stored by [`CacheIndex::record`].
fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, String> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}
