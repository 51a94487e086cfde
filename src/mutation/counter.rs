//! Counter snapshots and pending mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::Cacheable;

/// Identifies one counter: an integer field on one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
  /// Document path of the entity.
  pub entity: String,
  /// Field holding the count (e.g. `likeCount`).
  pub counter: String,
}

impl CounterKey {
  pub fn new(entity: impl Into<String>, counter: impl Into<String>) -> Self {
    Self {
      entity: entity.into(),
      counter: counter.into(),
    }
  }

  /// Inverse of the `entity#counter` display form used as the cache key.
  pub fn parse(id: &str) -> Option<Self> {
    let (entity, counter) = id.rsplit_once('#')?;
    (!entity.is_empty() && !counter.is_empty()).then(|| Self::new(entity, counter))
  }
}

impl fmt::Display for CounterKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.entity, self.counter)
  }
}

/// How far a cached counter value can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
  /// Confirmed by the backend.
  Authoritative,
  /// Includes local deltas the backend has not confirmed yet.
  Optimistic,
}

/// The locally visible value of a counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
  pub key: CounterKey,
  pub value: i64,
  pub confidence: Confidence,
  pub last_reconciled: Option<DateTime<Utc>>,
  pub updated_at: DateTime<Utc>,
}

impl CounterSnapshot {
  pub fn authoritative(key: CounterKey, value: i64) -> Self {
    Self {
      key,
      value,
      confidence: Confidence::Authoritative,
      last_reconciled: None,
      updated_at: Utc::now(),
    }
  }
}

impl Cacheable for CounterSnapshot {
  fn cache_key(&self) -> String {
    self.key.to_string()
  }

  fn version(&self) -> Option<String> {
    Some(self.updated_at.to_rfc3339())
  }

  fn entity_type() -> &'static str {
    "counter"
  }
}

/// Lifecycle of a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  /// Applied locally, waiting behind an in-flight submission.
  Pending,
  /// Submitted to the backend.
  Inflight,
  Committed,
  Failed,
}

/// A locally applied counter change awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  pub id: u64,
  pub key: CounterKey,
  pub delta: i64,
  pub applied_at: DateTime<Utc>,
  pub state: MutationState,
  /// Value to restore if the submission fails.
  pub rollback_value: i64,
}

/// Per-counter state machine:
/// `Clean -> OptimisticPending -> {Committed -> Clean, RolledBack -> Clean}`.
///
/// `Committed` and `RolledBack` are reported in events and then settle to
/// `Clean` immediately; a counter at rest is always `Clean` or
/// `OptimisticPending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPhase {
  Clean,
  OptimisticPending,
  Committed,
  RolledBack,
}

/// A request to change a counter by `delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
  pub key: CounterKey,
  pub delta: i64,
}

impl Mutation {
  pub fn new(key: CounterKey, delta: i64) -> Self {
    Self { key, delta }
  }

  pub fn increment(entity: &str, counter: &str) -> Self {
    Self::new(CounterKey::new(entity, counter), 1)
  }

  pub fn decrement(entity: &str, counter: &str) -> Self {
    Self::new(CounterKey::new(entity, counter), -1)
  }
}
