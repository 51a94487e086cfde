//! Out-of-band correction of stored counters.
//!
//! Optimistic submissions can be lost or applied twice when the network fails
//! halfway. This job recomputes each counter from the documents it counts and
//! overwrites the stored value whenever the two disagree.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::mutation::{CounterKey, OptimisticMutationEngine};
use crate::remote::{Cursor, Fields, Filter, Query, RemoteStore};

/// How the true value of a counter is computed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
  /// Documents in `collection` whose `field` holds the entity's path.
  CountWhere { collection: String, field: String },
  /// Documents in the named sub-collection of the entity.
  Subcollection(String),
}

impl Aggregate {
  /// The query whose result count is the counter's true value for `entity`.
  pub fn query(&self, entity: &str) -> Query {
    match self {
      Aggregate::CountWhere { collection, field } => {
        Query::collection(collection.clone()).filter(Filter::eq(field.clone(), entity))
      }
      Aggregate::Subcollection(name) => Query::collection(format!("{}/{}", entity, name)),
    }
  }
}

/// A stored counter field and how to recompute it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CounterRule {
  pub field: String,
  pub aggregate: Aggregate,
}

/// One page of a collection to reconcile.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileScope {
  pub collection: String,
  pub limit: usize,
  pub start_after: Option<Cursor>,
}

impl ReconcileScope {
  pub fn first(collection: impl Into<String>, limit: usize) -> Self {
    Self {
      collection: collection.into(),
      limit: limit.max(1),
      start_after: None,
    }
  }

  /// The page after this one, given the report for it.
  pub fn next(&self, report: &DriftReport) -> Option<Self> {
    report.next_cursor.clone().map(|cursor| Self {
      start_after: Some(cursor),
      ..self.clone()
    })
  }
}

/// A counter whose stored value disagreed with its recomputed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
  pub key: CounterKey,
  pub stored: i64,
  pub actual: i64,
  /// `actual - stored`.
  pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
  /// Entities read in this scope.
  pub examined: usize,
  /// Counters recomputed.
  pub checked: usize,
  /// Counters found wrong and overwritten.
  pub drifts: Vec<Drift>,
  /// Counters left alone because optimistic mutations were outstanding, or
  /// because the stored value moved while it was being checked.
  pub skipped: Vec<CounterKey>,
  /// Counters that could not be recomputed or written.
  pub errors: Vec<(CounterKey, Error)>,
  /// Where the next scope starts, if the collection has more entities.
  pub next_cursor: Option<Cursor>,
}

impl DriftReport {
  pub fn is_clean(&self) -> bool {
    self.drifts.is_empty() && self.errors.is_empty()
  }
}

/// Recomputes counters of one collection against the store.
#[derive(Clone)]
pub struct ReconciliationJob {
  store: Arc<dyn RemoteStore>,
  rules: Vec<CounterRule>,
  engine: Option<OptimisticMutationEngine>,
}

impl ReconciliationJob {
  pub fn new(store: Arc<dyn RemoteStore>, rules: Vec<CounterRule>) -> Self {
    Self {
      store,
      rules,
      engine: None,
    }
  }

  /// Skip counters the engine has in flight and feed it corrected values.
  pub fn with_engine(mut self, engine: OptimisticMutationEngine) -> Self {
    self.engine = Some(engine);
    self
  }

  pub fn rules(&self) -> &[CounterRule] {
    &self.rules
  }

  /// Reconcile every counter rule for the entities in `scope`.
  ///
  /// Failing to list the scope is an error; failures on single counters are
  /// collected in the report and do not stop the run.
  pub async fn reconcile(&self, scope: &ReconcileScope) -> Result<DriftReport> {
    let query = Query::collection(scope.collection.clone())
      .limit(scope.limit)
      .start_after(scope.start_after.clone());
    let entities = self.store.query(&query).await?;

    let mut report = DriftReport {
      examined: entities.len(),
      next_cursor: match entities.last() {
        Some(last) if entities.len() >= scope.limit => Some(Cursor::at(last, &query.order_by)),
        _ => None,
      },
      ..DriftReport::default()
    };

    for entity in &entities {
      for rule in &self.rules {
        let key = CounterKey::new(entity.path.clone(), rule.field.clone());
        if self.engine.as_ref().is_some_and(|e| e.has_pending(&key)) {
          debug!(%key, "optimistic mutations outstanding, skipping");
          report.skipped.push(key);
          continue;
        }

        match self.check(&key, entity.get_i64(&rule.field), &rule.aggregate).await {
          Ok(drift) => {
            report.checked += 1;
            if let Some(drift) = drift {
              report.drifts.push(drift);
            }
          }
          Err(Error::Conflict(_)) => {
            debug!(%key, "counter changed during reconciliation, skipping");
            report.skipped.push(key);
          }
          Err(err) => {
            warn!(%key, error = %err, "failed to reconcile counter");
            report.errors.push((key, err));
          }
        }
      }
    }

    info!(
      collection = %scope.collection,
      examined = report.examined,
      checked = report.checked,
      drifts = report.drifts.len(),
      skipped = report.skipped.len(),
      errors = report.errors.len(),
      "reconciliation finished"
    );
    Ok(report)
  }

  /// Recompute one counter, overwriting the stored value if it drifted.
  async fn check(
    &self,
    key: &CounterKey,
    stored: Result<i64>,
    aggregate: &Aggregate,
  ) -> Result<Option<Drift>> {
    let actual = self.store.count(&aggregate.query(&key.entity)).await?;
    let actual = i64::try_from(actual).map_err(|_| Error::InvalidDocument {
      path: key.entity.clone(),
      reason: format!("{} count overflows", key.counter),
    })?;

    let expected = stored.as_ref().ok().copied();
    // An unreadable stored value is overwritten like any other drift.
    let (stored, readable) = match stored {
      Ok(value) => (value, true),
      Err(err) => {
        warn!(%key, error = %err, "stored counter unreadable, treating as 0");
        (0, false)
      }
    };

    let drift = if !readable || stored != actual {
      // Write only if nothing committed since the value was read; the count
      // may not include that change.
      let field = key.counter.clone();
      let path = key.entity.clone();
      self
        .store
        .run_transaction(
          &key.entity,
          Box::new(move |current| {
            let Some(doc) = current else {
              return Err(Error::Conflict(path));
            };
            if doc.get_i64(&field).ok() != expected {
              return Err(Error::Conflict(path));
            }
            let mut fields = Fields::new();
            fields.insert(field, Value::from(actual));
            Ok(fields)
          }),
        )
        .await?;

      let drift = Drift {
        key: key.clone(),
        stored,
        actual,
        delta: actual.saturating_sub(stored),
      };
      info!(%key, stored, actual, drift = drift.delta, "corrected counter drift");
      Some(drift)
    } else {
      None
    };

    if let Some(engine) = &self.engine {
      engine.accept_authoritative(key, actual).await;
    }
    Ok(drift)
  }

  /// Reconcile `collection` one page per tick until `shutdown` turns true.
  ///
  /// Each tick handles the page after the previous one; after the last page
  /// the walk starts again from the beginning.
  pub fn spawn(
    self,
    config: &ReconcileConfig,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let first = ReconcileScope::first(config.collection.clone(), config.batch_size);
    let period: Duration = config.interval();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut scope = first.clone();

      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
            continue;
          }
        }

        scope = match self.reconcile(&scope).await {
          Ok(report) => scope.next(&report).unwrap_or_else(|| first.clone()),
          Err(err) => {
            warn!(error = %err, "reconciliation round failed");
            scope
          }
        };
      }
      debug!("reconciliation job stopped");
    })
  }
}
