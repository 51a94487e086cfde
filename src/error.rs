//! Error taxonomy shared by every component.
//!
//! A cache miss is not an error: lookups return `Option`. Corrupt local state is
//! recorded here for logging but is never propagated out of the cache layer.

use thiserror::Error;

/// Errors surfaced by the remote store, the mutation engine and reconciliation.
///
/// The type is `Clone` so that a single failed fetch can be handed to every
/// waiter attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// Network or backend hiccup. Safe to retry.
  #[error("transient network failure: {0}")]
  TransientNetwork(String),

  /// The backend refused the operation. Retrying will not help.
  #[error("not authorized: {0}")]
  Authorization(String),

  /// The document path does not resolve on the backend.
  #[error("document not found: {0}")]
  NotFound(String),

  /// A local cache file or index row could not be decoded.
  #[error("corrupt local state at {path}: {reason}")]
  CorruptLocalState { path: String, reason: String },

  /// Local persistence (disk tier or cache index) failed.
  #[error("local storage error: {0}")]
  Storage(String),

  /// A document is missing a field or carries the wrong type.
  #[error("invalid document {path}: {reason}")]
  InvalidDocument { path: String, reason: String },

  /// A mutation was applied to a counter the engine has never loaded.
  #[error("counter {0} has not been loaded")]
  CounterNotLoaded(String),

  /// A conditional write found the document changed since it was read.
  #[error("document changed concurrently: {0}")]
  Conflict(String),

  /// The background submission task went away before reporting an outcome.
  #[error("mutation outcome lost: {0}")]
  OutcomeLost(String),
}

impl Error {
  /// Whether the caller may retry the same operation later.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::TransientNetwork(_) | Error::Conflict(_) | Error::OutcomeLost(_)
    )
  }

  pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
    Error::Storage(format!("{}: {}", context, err))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Error::storage("cache index", err)
  }
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self {
    Error::storage("io", err)
  }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
