//! In-process [`RemoteStore`] backend with call accounting and fault
//! injection.
//!
//! Queries apply the same filter, ordering and cursor rules a real backend
//! would, so feed and reconciliation code runs against it unchanged.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use super::{Document, Fields, Query, RemoteStore, TransactionFn};
use crate::error::{Error, Result};

/// Which store primitive a call went through, for call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Get,
  Put,
  Delete,
  Query,
  Transaction,
}

#[derive(Debug, Default)]
struct CallCounts {
  get: AtomicUsize,
  put: AtomicUsize,
  delete: AtomicUsize,
  query: AtomicUsize,
  transaction: AtomicUsize,
}

impl CallCounts {
  fn slot(&self, op: Operation) -> &AtomicUsize {
    match op {
      Operation::Get => &self.get,
      Operation::Put => &self.put,
      Operation::Delete => &self.delete,
      Operation::Query => &self.query,
      Operation::Transaction => &self.transaction,
    }
  }
}

/// In-process document store.
///
/// Every call is counted, and calls can be held back behind a gate or made to
/// fail, which the tests rely on.
pub struct MemoryStore {
  docs: Mutex<BTreeMap<String, Document>>,
  faults: Mutex<VecDeque<Error>>,
  gate: watch::Sender<bool>,
  calls: CallCounts,
}

impl MemoryStore {
  pub fn new() -> Self {
    let (gate, _) = watch::channel(true);
    Self {
      docs: Mutex::new(BTreeMap::new()),
      faults: Mutex::new(VecDeque::new()),
      gate,
      calls: CallCounts::default(),
    }
  }

  /// Insert or replace a document without counting it as a call.
  pub fn seed(&self, path: &str, fields: Fields) {
    let mut docs = self.lock_docs();
    docs.insert(path.to_string(), Document::new(path, fields));
  }

  /// Current document at `path`, bypassing gate, faults and counters.
  pub fn peek(&self, path: &str) -> Option<Document> {
    self.lock_docs().get(path).cloned()
  }

  pub fn len(&self) -> usize {
    self.lock_docs().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Make the next call fail with `err`. Queued faults are consumed in order.
  pub fn fail_next(&self, err: Error) {
    self
      .faults
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push_back(err);
  }

  /// Hold every subsequent call until [`MemoryStore::resume`].
  pub fn pause(&self) {
    self.gate.send_replace(false);
  }

  pub fn resume(&self) {
    self.gate.send_replace(true);
  }

  /// Number of calls made through `op`.
  pub fn calls(&self, op: Operation) -> usize {
    self.calls.slot(op).load(Ordering::SeqCst)
  }

  pub fn total_calls(&self) -> usize {
    [
      Operation::Get,
      Operation::Put,
      Operation::Delete,
      Operation::Query,
      Operation::Transaction,
    ]
    .into_iter()
    .map(|op| self.calls(op))
    .sum()
  }

  fn lock_docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Document>> {
    self.docs.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Count the call, wait at the gate, then apply any injected fault.
  async fn enter(&self, op: Operation) -> Result<()> {
    self.calls.slot(op).fetch_add(1, Ordering::SeqCst);

    let mut gate = self.gate.subscribe();
    // The sender lives in `self`, so the channel cannot close under us.
    let _ = gate.wait_for(|open| *open).await;

    let fault = self
      .faults
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .pop_front();
    match fault {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl RemoteStore for MemoryStore {
  async fn get(&self, path: &str) -> Result<Document> {
    self.enter(Operation::Get).await?;
    self
      .lock_docs()
      .get(path)
      .cloned()
      .ok_or_else(|| Error::NotFound(path.to_string()))
  }

  async fn put(&self, path: &str, fields: Fields) -> Result<Document> {
    self.enter(Operation::Put).await?;
    let mut docs = self.lock_docs();
    let doc = docs
      .entry(path.to_string())
      .or_insert_with(|| Document::new(path, Fields::new()));
    doc.fields.extend(fields);
    doc.update_time = Utc::now();
    Ok(doc.clone())
  }

  async fn delete(&self, path: &str) -> Result<()> {
    self.enter(Operation::Delete).await?;
    self.lock_docs().remove(path);
    Ok(())
  }

  async fn query(&self, query: &Query) -> Result<Vec<Document>> {
    self.enter(Operation::Query).await?;
    let docs = self.lock_docs();
    let mut matched: Vec<Document> = docs
      .values()
      .filter(|d| d.collection() == query.collection)
      .filter(|d| query.filters.iter().all(|f| f.matches(d)))
      .filter(|d| query.is_after_cursor(d))
      .cloned()
      .collect();
    drop(docs);

    matched.sort_by(|a, b| query.compare(a, b));
    if let Some(limit) = query.limit {
      matched.truncate(limit);
    }
    Ok(matched)
  }

  async fn run_transaction(&self, path: &str, update: TransactionFn) -> Result<Document> {
    self.enter(Operation::Transaction).await?;
    // The closure is synchronous, so holding the lock across it keeps the
    // read-modify-write atomic without spanning an await.
    let mut docs = self.lock_docs();
    let fields = update(docs.get(path))?;
    let doc = docs
      .entry(path.to_string())
      .or_insert_with(|| Document::new(path, Fields::new()));
    doc.fields.extend(fields);
    doc.update_time = Utc::now();
    Ok(doc.clone())
  }
}
