//! Optimistic counter updates with one outstanding submission per counter.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::counter::{
  Confidence, CounterKey, CounterPhase, CounterSnapshot, Mutation, MutationState, PendingMutation,
};
use crate::cache::{MemoryWrite, TieredCache};
use crate::error::{Error, Result};
use crate::remote::RemoteStore;

const EVENT_CAPACITY: usize = 64;

/// Settlement of a counter's submission, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
  /// The backend confirmed the submission; `value` is the server's value.
  Committed { key: CounterKey, value: i64 },
  /// The submission failed; the counter was restored to `value`.
  RolledBack {
    key: CounterKey,
    value: i64,
    error: Error,
  },
}

impl MutationEvent {
  pub fn key(&self) -> &CounterKey {
    match self {
      MutationEvent::Committed { key, .. } | MutationEvent::RolledBack { key, .. } => key,
    }
  }

  pub fn phase(&self) -> CounterPhase {
    match self {
      MutationEvent::Committed { .. } => CounterPhase::Committed,
      MutationEvent::RolledBack { .. } => CounterPhase::RolledBack,
    }
  }
}

/// Resolves once the backend has accepted or rejected a mutation.
#[derive(Debug)]
pub struct MutationTicket {
  id: u64,
  rx: oneshot::Receiver<Result<i64>>,
}

impl MutationTicket {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Wait for the server-confirmed value, or the error that rolled the
  /// mutation back.
  pub async fn confirmed(self) -> Result<i64> {
    match self.rx.await {
      Ok(outcome) => outcome,
      Err(_) => Err(Error::OutcomeLost(format!("mutation {}", self.id))),
    }
  }
}

/// What `apply` returns: the value readers now see, plus a ticket for the
/// eventual outcome.
#[derive(Debug)]
pub struct LocalResult {
  pub value: i64,
  pub ticket: MutationTicket,
}

struct Waiter {
  mutation: PendingMutation,
  tx: oneshot::Sender<Result<i64>>,
}

impl Waiter {
  fn resolve(self, outcome: Result<i64>) {
    // The caller may have dropped its ticket.
    let _ = self.tx.send(outcome);
  }
}

struct CounterSlot {
  /// Last server-confirmed value.
  base: i64,
  /// Value readers see: `base` plus every unconfirmed delta.
  visible: i64,
  /// Mutations carried by the submission currently on the wire.
  inflight: Vec<Waiter>,
  /// Mutations applied while a submission was on the wire, composed into
  /// the next one.
  queued: Vec<Waiter>,
  last_reconciled: Option<DateTime<Utc>>,
  /// Bumped on every published snapshot.
  revision: u64,
}

impl CounterSlot {
  fn new(value: i64) -> Self {
    Self {
      base: value,
      visible: value,
      inflight: Vec::new(),
      queued: Vec::new(),
      last_reconciled: None,
      revision: 0,
    }
  }

  fn phase(&self) -> CounterPhase {
    if self.inflight.is_empty() {
      CounterPhase::Clean
    } else {
      CounterPhase::OptimisticPending
    }
  }

  fn snapshot(&self, key: &CounterKey) -> CounterSnapshot {
    CounterSnapshot {
      key: key.clone(),
      value: self.visible,
      confidence: match self.phase() {
        CounterPhase::OptimisticPending => Confidence::Optimistic,
        _ => Confidence::Authoritative,
      },
      last_reconciled: self.last_reconciled,
      updated_at: Utc::now(),
    }
  }

  /// Snapshot to publish for a change just made, with its revision.
  fn next_snapshot(&mut self, key: &CounterKey) -> (CounterSnapshot, u64) {
    self.revision += 1;
    (self.snapshot(key), self.revision)
  }

  /// Promote the queued mutations to a new submission, returning its delta.
  fn promote_queued(&mut self) -> Option<i64> {
    if self.queued.is_empty() {
      return None;
    }
    self.inflight = std::mem::take(&mut self.queued);
    for waiter in &mut self.inflight {
      waiter.mutation.state = MutationState::Inflight;
    }
    Some(self.inflight.iter().map(|w| w.mutation.delta).sum())
  }
}

/// A snapshot already visible in the memory tier, waiting to be indexed and
/// persisted outside the slots lock.
struct Published {
  snapshot: CounterSnapshot,
  /// Slot revision the snapshot was taken at; `None` for unloaded counters.
  revision: Option<u64>,
  write: MemoryWrite,
}

/// Outcome of one submission, delivered once the snapshot is persisted.
struct Settlement {
  /// Delta of the follow-up submission composed from queued mutations.
  next: Option<i64>,
  published: Published,
  waiters: Vec<Waiter>,
  outcome: Result<i64>,
  event: MutationEvent,
}

struct Inner {
  store: Arc<dyn RemoteStore>,
  counters: Arc<TieredCache<CounterSnapshot>>,
  slots: Mutex<HashMap<CounterKey, CounterSlot>>,
  events: broadcast::Sender<MutationEvent>,
  next_id: AtomicU64,
}

/// The single writer of counter values.
///
/// `apply` updates the cached counter synchronously and hands the delta to a
/// background submission. Per counter at most one submission is in flight;
/// deltas applied meanwhile are summed into the next one. A failed
/// submission rolls the counter back to its last confirmed value and fails
/// every mutation that was riding on it. Nothing is retried automatically.
#[derive(Clone)]
pub struct OptimisticMutationEngine {
  inner: Arc<Inner>,
}

impl OptimisticMutationEngine {
  pub fn new(store: Arc<dyn RemoteStore>, counters: Arc<TieredCache<CounterSnapshot>>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        store,
        counters,
        slots: Mutex::new(HashMap::new()),
        events,
        next_id: AtomicU64::new(1),
      }),
    }
  }

  fn lock_slots(&self) -> MutexGuard<'_, HashMap<CounterKey, CounterSlot>> {
    self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// The cache counter snapshots are published to.
  pub fn counters(&self) -> &Arc<TieredCache<CounterSnapshot>> {
    &self.inner.counters
  }

  /// Read the authoritative value of `key` from the store.
  ///
  /// A counter with unconfirmed mutations keeps its optimistic value; the
  /// submission already on the wire will bring the confirmed one.
  pub async fn load(&self, key: &CounterKey) -> Result<CounterSnapshot> {
    let doc = self.inner.store.get(&key.entity).await?;
    let value = doc.get_i64(&key.counter)?;

    let published = {
      let mut slots = self.lock_slots();
      let slot = slots
        .entry(key.clone())
        .or_insert_with(|| CounterSlot::new(value));
      if slot.phase() == CounterPhase::Clean {
        slot.base = value;
        slot.visible = value;
      } else {
        debug!(%key, "counter has pending mutations, keeping optimistic value");
      }
      let (snapshot, revision) = slot.next_snapshot(key);
      self.publish(&mut slots, snapshot, Some(revision))
    };

    Ok(self.flush(published).await)
  }

  /// Apply `mutation` locally and schedule its submission.
  ///
  /// The new value is visible through [`OptimisticMutationEngine::snapshot`]
  /// and the counter cache before this returns. Must be called from within a
  /// Tokio runtime.
  pub fn apply(&self, mutation: Mutation) -> Result<LocalResult> {
    let Mutation { key, delta } = mutation;
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();

    let (value, submit, published) = {
      let mut slots = self.lock_slots();
      let slot = slots
        .get_mut(&key)
        .ok_or_else(|| Error::CounterNotLoaded(key.to_string()))?;

      let rollback_value = slot.visible;
      slot.visible += delta;
      let start = slot.inflight.is_empty();
      let waiter = Waiter {
        mutation: PendingMutation {
          id,
          key: key.clone(),
          delta,
          applied_at: Utc::now(),
          state: if start {
            MutationState::Inflight
          } else {
            MutationState::Pending
          },
          rollback_value,
        },
        tx,
      };
      if start {
        slot.inflight.push(waiter);
      } else {
        slot.queued.push(waiter);
      }
      let value = slot.visible;
      let (snapshot, revision) = slot.next_snapshot(&key);
      // Snapshots reach the memory tier in slot order.
      (value, start, self.publish(&mut slots, snapshot, Some(revision)))
    };
    self.inner.counters.record(published.write);

    debug!(%key, delta, value, queued = !submit, "applied optimistic mutation");

    if submit {
      let engine = self.clone();
      tokio::spawn(async move { engine.drive(key, delta).await });
    }

    Ok(LocalResult {
      value,
      ticket: MutationTicket { id, rx },
    })
  }

  /// Submit `delta` for `key`, then keep submitting composed queued deltas
  /// until the counter is clean.
  async fn drive(self, key: CounterKey, mut delta: i64) {
    loop {
      let outcome = self
        .inner
        .store
        .increment(&key.entity, &key.counter, delta)
        .await;
      let Some(settlement) = self.settle(&key, outcome) else {
        break;
      };

      // Confirmed or restored values are durable before anyone hears of them.
      let Published { snapshot, write, .. } = settlement.published;
      self.inner.counters.record(write);
      self.inner.counters.persist(&snapshot).await;
      for waiter in settlement.waiters {
        waiter.resolve(settlement.outcome.clone());
      }
      let _ = self.inner.events.send(settlement.event);

      match settlement.next {
        Some(composed) => delta = composed,
        None => break,
      }
    }
  }

  /// Record the outcome of the in-flight submission for `key` and publish
  /// the resulting snapshot to the memory tier.
  fn settle(&self, key: &CounterKey, outcome: Result<i64>) -> Option<Settlement> {
    let mut slots = self.lock_slots();
    let slot = slots.get_mut(key)?;
    let settled = std::mem::take(&mut slot.inflight);

    let (next, waiters, outcome, event) = match outcome {
      Ok(server_value) => {
        slot.base = server_value;
        let queued: i64 = slot.queued.iter().map(|w| w.mutation.delta).sum();
        slot.visible = server_value + queued;
        info!(%key, value = server_value, mutations = settled.len(), "counter committed");
        let event = MutationEvent::Committed {
          key: key.clone(),
          value: server_value,
        };
        (slot.promote_queued(), settled, Ok(server_value), event)
      }
      Err(err) => {
        let waiters: Vec<Waiter> = settled
          .into_iter()
          .chain(std::mem::take(&mut slot.queued))
          .collect();
        slot.visible = slot.base;
        let value = slot.base;
        warn!(%key, error = %err, value, mutations = waiters.len(), "counter rolled back");
        let event = MutationEvent::RolledBack {
          key: key.clone(),
          value,
          error: err.clone(),
        };
        (None, waiters, Err(err), event)
      }
    };

    let (snapshot, revision) = slot.next_snapshot(key);
    Some(Settlement {
      next,
      published: self.publish(&mut slots, snapshot, Some(revision)),
      waiters,
      outcome,
      event,
    })
  }

  /// Put `snapshot` in the memory tier. Clean slots whose snapshots this
  /// pushes out of memory are released; a later
  /// [`OptimisticMutationEngine::load`] brings them back.
  ///
  /// Runs under the slots lock and does no I/O.
  fn publish(
    &self,
    slots: &mut HashMap<CounterKey, CounterSlot>,
    snapshot: CounterSnapshot,
    revision: Option<u64>,
  ) -> Published {
    let write = self.inner.counters.write_memory(snapshot.clone());
    for evicted in write.evicted().iter().filter_map(|id| CounterKey::parse(id)) {
      let clean = slots
        .get(&evicted)
        .is_some_and(|slot| slot.phase() == CounterPhase::Clean);
      if clean && evicted != snapshot.key {
        slots.remove(&evicted);
        debug!(key = %evicted, "released clean counter evicted from memory");
      }
    }
    Published {
      snapshot,
      revision,
      write,
    }
  }

  /// Index and persist a snapshot from `load` or `accept_authoritative`.
  /// The disk write is skipped when a newer snapshot has been published.
  async fn flush(&self, published: Published) -> CounterSnapshot {
    let Published {
      snapshot,
      revision,
      write,
    } = published;
    self.inner.counters.record(write);

    let current = revision.map_or(true, |revision| {
      self
        .lock_slots()
        .get(&snapshot.key)
        .map_or(true, |slot| slot.revision == revision)
    });
    if current {
      self.inner.counters.persist(&snapshot).await;
    } else {
      debug!(key = %snapshot.key, "newer snapshot published, skipping disk write");
    }
    snapshot
  }

  /// Current locally visible state of `key`, if loaded.
  pub fn snapshot(&self, key: &CounterKey) -> Option<CounterSnapshot> {
    self.lock_slots().get(key).map(|slot| slot.snapshot(key))
  }

  pub fn phase(&self, key: &CounterKey) -> Option<CounterPhase> {
    self.lock_slots().get(key).map(CounterSlot::phase)
  }

  /// Unconfirmed mutations for `key`, oldest first.
  pub fn pending(&self, key: &CounterKey) -> Vec<PendingMutation> {
    self
      .lock_slots()
      .get(key)
      .map(|slot| {
        slot
          .inflight
          .iter()
          .chain(&slot.queued)
          .map(|w| w.mutation.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn has_pending(&self, key: &CounterKey) -> bool {
    self.phase(key) == Some(CounterPhase::OptimisticPending)
  }

  /// Commit and rollback notifications for every counter.
  pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
    self.inner.events.subscribe()
  }

  /// Take `value` as the confirmed value of `key` after reconciliation.
  ///
  /// Returns `false` without changing anything when the counter has
  /// unconfirmed mutations. Counters that were never loaded only have their
  /// cached snapshot refreshed.
  pub async fn accept_authoritative(&self, key: &CounterKey, value: i64) -> bool {
    let now = Utc::now();
    let published = {
      let mut slots = self.lock_slots();
      let (snapshot, revision) = match slots.get_mut(key) {
        Some(slot) if slot.phase() == CounterPhase::OptimisticPending => {
          debug!(%key, "skipping authoritative update, mutations pending");
          return false;
        }
        Some(slot) => {
          slot.base = value;
          slot.visible = value;
          slot.last_reconciled = Some(now);
          let (snapshot, revision) = slot.next_snapshot(key);
          (snapshot, Some(revision))
        }
        None => {
          let snapshot = CounterSnapshot {
            last_reconciled: Some(now),
            ..CounterSnapshot::authoritative(key.clone(), value)
          };
          (snapshot, None)
        }
      };
      self.publish(&mut slots, snapshot, revision)
    };
    self.flush(published).await;
    true
  }

  /// Release `key` so its memory is reclaimed. Returns `false`, keeping the
  /// counter, while it has unconfirmed mutations.
  pub fn forget(&self, key: &CounterKey) -> bool {
    let mut slots = self.lock_slots();
    match slots.get(key) {
      Some(slot) if slot.phase() == CounterPhase::OptimisticPending => false,
      Some(_) => {
        slots.remove(key);
        true
      }
      None => true,
    }
  }

  /// Number of counters currently loaded.
  pub fn loaded(&self) -> usize {
    self.lock_slots().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheIndex, DiskTier};
  use crate::config::MemoryCapacity;
  use crate::remote::{Document, Fields, MemoryStore, Operation, Query, TransactionFn};
  use async_trait::async_trait;
  use serde_json::json;
  use std::time::Duration;
  use tokio::sync::watch;

  const POST: &str = "posts/p1";

  fn likes() -> CounterKey {
    CounterKey::new(POST, "likeCount")
  }

  async fn engine_with(store: Arc<dyn RemoteStore>, dir: &std::path::Path) -> OptimisticMutationEngine {
    engine_holding(store, dir, 32).await
  }

  async fn engine_holding(
    store: Arc<dyn RemoteStore>,
    dir: &std::path::Path,
    counters: usize,
  ) -> OptimisticMutationEngine {
    let disk = DiskTier::open(dir, chrono::Duration::hours(1)).await.unwrap();
    let index = Arc::new(CacheIndex::open_in_memory().unwrap());
    let counters = TieredCache::new(MemoryCapacity::Entries(counters), disk, index).await;
    OptimisticMutationEngine::new(store, Arc::new(counters))
  }

  fn seed_post(store: &MemoryStore, path: &str, likes: i64) {
    let mut fields = Fields::new();
    fields.insert("likeCount".into(), json!(likes));
    store.seed(path, fields);
  }

  fn seeded(likes: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    seed_post(&store, POST, likes);
    store
  }

  /// Serves reads immediately but holds transactions until `open` is set.
  struct HeldWrites {
    inner: Arc<MemoryStore>,
    open: watch::Receiver<bool>,
  }

  #[async_trait]
  impl RemoteStore for HeldWrites {
    async fn get(&self, path: &str) -> Result<Document> {
      self.inner.get(path).await
    }

    async fn put(&self, path: &str, fields: Fields) -> Result<Document> {
      self.inner.put(path, fields).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
      self.inner.delete(path).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
      self.inner.query(query).await
    }

    async fn run_transaction(&self, path: &str, update: TransactionFn) -> Result<Document> {
      let mut open = self.open.clone();
      let _ = open.wait_for(|open| *open).await;
      self.inner.run_transaction(path, update).await
    }
  }

  fn stored_likes(store: &MemoryStore) -> i64 {
    store.peek(POST).unwrap().get_i64("likeCount").unwrap()
  }

  #[tokio::test]
  async fn test_apply_requires_loaded_counter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(seeded(5), dir.path()).await;

    let err = engine.apply(Mutation::new(likes(), 1)).unwrap_err();
    assert_eq!(err, Error::CounterNotLoaded("posts/p1#likeCount".into()));
  }

  #[tokio::test]
  async fn test_apply_is_visible_then_committed() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();
    store.pause();

    let local = engine.apply(Mutation::new(likes(), 1)).unwrap();
    assert_eq!(local.value, 6);
    let cached = engine.counters().get_memory(&likes().to_string()).unwrap();
    assert_eq!(cached.value, 6);
    assert_eq!(cached.confidence, Confidence::Optimistic);
    assert_eq!(engine.phase(&likes()), Some(CounterPhase::OptimisticPending));

    store.resume();
    assert_eq!(local.ticket.confirmed().await, Ok(6));
    assert_eq!(stored_likes(&store), 6);
    let snap = engine.snapshot(&likes()).unwrap();
    assert_eq!((snap.value, snap.confidence), (6, Confidence::Authoritative));
    assert_eq!(engine.phase(&likes()), Some(CounterPhase::Clean));
  }

  #[tokio::test]
  async fn test_queued_deltas_are_composed() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();
    store.pause();

    let first = engine.apply(Mutation::new(likes(), 1)).unwrap();
    let second = engine.apply(Mutation::new(likes(), 1)).unwrap();
    let third = engine.apply(Mutation::new(likes(), 1)).unwrap();
    assert_eq!((first.value, second.value, third.value), (6, 7, 8));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.calls(Operation::Transaction), 1);
    let pending = engine.pending(&likes());
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].state, MutationState::Inflight);
    assert_eq!(pending[1].state, MutationState::Pending);
    assert_eq!(pending[1].rollback_value, 6);

    store.resume();
    assert_eq!(first.ticket.confirmed().await, Ok(6));
    assert_eq!(second.ticket.confirmed().await, Ok(8));
    assert_eq!(third.ticket.confirmed().await, Ok(8));

    assert_eq!(store.calls(Operation::Transaction), 2);
    assert_eq!(stored_likes(&store), 8);
    assert!(!engine.has_pending(&likes()));
  }

  #[tokio::test]
  async fn test_failure_rolls_back_whole_chain() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();
    let mut events = engine.subscribe();
    store.pause();
    store.fail_next(Error::TransientNetwork("connection reset".into()));

    let first = engine.apply(Mutation::new(likes(), 1)).unwrap();
    let second = engine.apply(Mutation::new(likes(), 1)).unwrap();
    assert_eq!(second.value, 7);
    store.resume();

    let failure = Error::TransientNetwork("connection reset".into());
    assert_eq!(first.ticket.confirmed().await, Err(failure.clone()));
    assert_eq!(second.ticket.confirmed().await, Err(failure.clone()));

    assert_eq!(engine.snapshot(&likes()).unwrap().value, 5);
    assert_eq!(engine.phase(&likes()), Some(CounterPhase::Clean));
    assert_eq!(stored_likes(&store), 5);
    assert_eq!(store.calls(Operation::Transaction), 1);

    let event = events.recv().await.unwrap();
    assert_eq!(event.phase(), CounterPhase::RolledBack);
    assert_eq!(
      event,
      MutationEvent::RolledBack {
        key: likes(),
        value: 5,
        error: failure,
      }
    );
  }

  #[tokio::test]
  async fn test_authorization_failure_discards_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(3);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();
    store.fail_next(Error::Authorization("token revoked".into()));

    let local = engine.apply(Mutation::new(likes(), -1)).unwrap();
    assert_eq!(local.value, 2);
    let err = local.ticket.confirmed().await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(engine.snapshot(&likes()).unwrap().value, 3);
  }

  #[tokio::test]
  async fn test_accept_authoritative_waits_for_clean_counter() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();
    store.pause();

    let local = engine.apply(Mutation::new(likes(), 1)).unwrap();
    assert!(!engine.accept_authoritative(&likes(), 40).await);
    store.resume();
    local.ticket.confirmed().await.unwrap();

    assert!(engine.accept_authoritative(&likes(), 40).await);
    let snap = engine.snapshot(&likes()).unwrap();
    assert_eq!(snap.value, 40);
    assert!(snap.last_reconciled.is_some());
  }

  #[tokio::test]
  async fn test_commit_adopts_concurrent_server_changes() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    let engine = engine_with(store.clone(), dir.path()).await;
    engine.load(&likes()).await.unwrap();

    // Another session likes the post after we loaded it.
    store.increment(POST, "likeCount", 10).await.unwrap();

    let local = engine.apply(Mutation::new(likes(), 1)).unwrap();
    assert_eq!(local.value, 6);
    assert_eq!(local.ticket.confirmed().await, Ok(16));
    assert_eq!(engine.snapshot(&likes()).unwrap().value, 16);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_reload_never_hides_optimistic_value() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryStore::new());
    let (release, open) = watch::channel(false);
    let store = Arc::new(HeldWrites {
      inner: backend.clone(),
      open,
    });
    let engine = engine_holding(store, dir.path(), 256).await;

    let mut tickets = Vec::new();
    for round in 0..100 {
      let key = CounterKey::new(format!("posts/p{}", round), "likeCount");
      seed_post(&backend, &key.entity, 5);
      engine.load(&key).await.unwrap();

      let reload = {
        let (engine, key) = (engine.clone(), key.clone());
        tokio::spawn(async move { engine.load(&key).await })
      };
      let apply = {
        let (engine, key) = (engine.clone(), key.clone());
        tokio::spawn(async move { engine.apply(Mutation::new(key, 1)) })
      };
      reload.await.unwrap().unwrap();
      tickets.push(apply.await.unwrap().unwrap().ticket);

      let cached = engine.counters().get_memory(&key.to_string()).unwrap();
      assert_eq!((cached.value, cached.confidence), (6, Confidence::Optimistic), "round {}", round);
    }

    release.send_replace(true);
    for ticket in tickets {
      assert_eq!(ticket.confirmed().await, Ok(6));
    }
  }

  #[tokio::test]
  async fn test_clean_counters_are_released_with_their_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(5);
    seed_post(&store, "posts/p3", 1);
    let engine = engine_holding(store.clone(), dir.path(), 1).await;
    let (p1, p2, p3) = (
      likes(),
      CounterKey::new("posts/p2", "likeCount"),
      CounterKey::new("posts/p3", "likeCount"),
    );

    engine.load(&p1).await.unwrap();
    store.pause();
    let local = engine.apply(Mutation::new(p1.clone(), 1)).unwrap();
    assert!(!engine.forget(&p1));

    // Pushes p1 out of memory, but p1 still has a submission on the wire.
    assert!(engine.accept_authoritative(&p2, 9).await);
    assert_eq!(engine.loaded(), 1);
    assert_eq!(engine.snapshot(&p1).unwrap().value, 6);

    store.resume();
    assert_eq!(local.ticket.confirmed().await, Ok(6));

    // p1 is clean now, so losing its memory entry releases it.
    engine.load(&p3).await.unwrap();
    assert_eq!(engine.loaded(), 1);
    assert!(engine.snapshot(&p1).is_none());
    assert_eq!(
      engine.apply(Mutation::new(p1.clone(), 1)).unwrap_err(),
      Error::CounterNotLoaded(p1.to_string())
    );
    assert_eq!(engine.counters().get(&p1.to_string()).await.unwrap().value, 6);

    assert!(engine.forget(&p3));
    assert_eq!(engine.loaded(), 0);
  }
}
