//! Single-flight fetch deduplication.
//!
//! At most one loader runs per key at a time. Callers arriving while a fetch is
//! in flight attach to it and receive a clone of its outcome, success or error.
//! Once the flight settles the key is cleared, so the next call starts fresh.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::Result;

type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight<T> {
  id: u64,
  future: Flight<T>,
}

/// Coalesces concurrent fetches of the same key into one loader call.
///
/// The shared future is driven by whichever waiter polls it, so dropping one
/// waiter never cancels a fetch that others are still awaiting. If every
/// waiter goes away the flight stays registered and the next caller for the
/// key resumes it.
pub struct FetchCoordinator<T> {
  in_flight: Mutex<HashMap<String, InFlight<T>>>,
  next_id: AtomicU64,
}

impl<T> FetchCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      in_flight: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Fetch `key`, running `loader` only if no fetch for `key` is in flight.
  ///
  /// The lookup and the registration of a new flight happen under one lock,
  /// so two callers can never both decide to start a fetch. `loader` only
  /// builds the future; it is not polled until after the lock is released.
  pub async fn fetch<F, Fut>(&self, key: &str, loader: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (id, flight) = self.join_or_start(key, loader);

    let result = flight.await;

    // Clear only our own flight; a newer one may already have replaced it.
    let mut in_flight = self.lock();
    if in_flight.get(key).is_some_and(|f| f.id == id) {
      in_flight.remove(key);
    }
    result
  }

  fn join_or_start<F, Fut>(&self, key: &str, loader: F) -> (u64, Flight<T>)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let mut in_flight = self.lock();
    if let Some(existing) = in_flight.get(key) {
      debug!(key, "joining in-flight fetch");
      return (existing.id, existing.future.clone());
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let future = loader().boxed().shared();
    in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        future: future.clone(),
      },
    );
    debug!(key, "starting fetch");
    (id, future)
  }

  /// Whether a fetch for `key` is currently registered.
  pub fn is_in_flight(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  /// Number of keys with a registered fetch.
  pub fn in_flight_count(&self) -> usize {
    self.lock().len()
  }
}

impl<T> Default for FetchCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;
  use tokio::sync::watch;

  /// Loader that counts invocations and waits for `gate` to open.
  fn gated_loader(
    calls: Arc<AtomicUsize>,
    gate: watch::Receiver<bool>,
    outcome: Result<u32>,
  ) -> impl Future<Output = Result<u32>> + Send + 'static {
    calls.fetch_add(1, Ordering::SeqCst);
    let mut gate = gate;
    async move {
      let _ = gate.wait_for(|open| *open).await;
      outcome
    }
  }

  #[tokio::test]
  async fn test_nine_concurrent_fetches_share_one_load() {
    let coordinator = Arc::new(FetchCoordinator::<u32>::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);

    let mut handles = Vec::new();
    for _ in 0..9 {
      let coordinator = coordinator.clone();
      let calls = calls.clone();
      let gate = gate.clone();
      handles.push(tokio::spawn(async move {
        coordinator
          .fetch("posts/p1", || gated_loader(calls, gate, Ok(42)))
          .await
      }));
    }

    tokio::task::yield_now().await;
    assert!(coordinator.is_in_flight("posts/p1"));
    open.send_replace(true);

    for h in handles {
      assert_eq!(h.await.unwrap(), Ok(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_error_reaches_every_waiter_then_clears() {
    let coordinator = Arc::new(FetchCoordinator::<u32>::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);
    let failure = Error::TransientNetwork("reset".into());

    let mut handles = Vec::new();
    for _ in 0..3 {
      let coordinator = coordinator.clone();
      let calls = calls.clone();
      let gate = gate.clone();
      let failure = failure.clone();
      handles.push(tokio::spawn(async move {
        coordinator
          .fetch("k", || gated_loader(calls, gate, Err(failure)))
          .await
      }));
    }
    tokio::task::yield_now().await;
    open.send_replace(true);

    for h in handles {
      assert_eq!(h.await.unwrap(), Err(failure.clone()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // State cleared: the next call runs the loader again.
    let retry = coordinator
      .fetch("k", || gated_loader(calls.clone(), gate.clone(), Ok(7)))
      .await;
    assert_eq!(retry, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_distinct_keys_fetch_independently() {
    let coordinator = FetchCoordinator::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (_open, gate) = watch::channel(true);

    let (a, b) = tokio::join!(
      coordinator.fetch("a", || gated_loader(calls.clone(), gate.clone(), Ok(1))),
      coordinator.fetch("b", || gated_loader(calls.clone(), gate.clone(), Ok(2))),
    );
    assert_eq!((a, b), (Ok(1), Ok(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_cancelled_waiter_does_not_cancel_shared_fetch() {
    let coordinator = Arc::new(FetchCoordinator::<u32>::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);

    let spawn_waiter = |coordinator: Arc<FetchCoordinator<u32>>| {
      let calls = calls.clone();
      let gate = gate.clone();
      tokio::spawn(async move {
        coordinator
          .fetch("k", || gated_loader(calls, gate, Ok(9)))
          .await
      })
    };

    let first = spawn_waiter(coordinator.clone());
    let second = spawn_waiter(coordinator.clone());
    tokio::task::yield_now().await;

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    open.send_replace(true);
    assert_eq!(second.await.unwrap(), Ok(9));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
