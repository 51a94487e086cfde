//! Client-side merge of several timestamp-ordered sources into one feed.
//!
//! Every source is read with its own cursor. Items fetched but not yet shown
//! stay buffered per source, and an item is only surfaced once every source
//! that still has data has been read past it, so pages never skip or repeat
//! items even when sources are fetched unevenly.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::Result;
use crate::remote::{Cursor, Fields, Filter, OrderBy, Query, RemoteStore};

/// One entry of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
  /// Globally unique id (the document path for store-backed sources).
  pub id: String,
  /// Id of the source the item came from.
  pub source: String,
  pub timestamp: i64,
  pub fields: Fields,
}

impl FeedItem {
  pub fn position(&self) -> FeedPosition {
    FeedPosition {
      timestamp: self.timestamp,
      id: self.id.clone(),
    }
  }
}

/// Feed order: newest first, ties broken by id, descending.
pub fn feed_order(a: &FeedItem, b: &FeedItem) -> Ordering {
  b.timestamp
    .cmp(&a.timestamp)
    .then_with(|| b.id.cmp(&a.id))
}

/// A `(timestamp, id)` point in feed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPosition {
  pub timestamp: i64,
  pub id: String,
}

/// Per-source pagination state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCursor {
  pub source_id: String,
  /// Last item of this source that was surfaced.
  pub consumed: Option<FeedPosition>,
  /// Last item of this source that was fetched.
  pub fetched: Option<FeedPosition>,
  /// The source returned a short page and has nothing left to fetch.
  pub exhausted: bool,
}

impl FeedCursor {
  fn new(source_id: &str) -> Self {
    Self {
      source_id: source_id.to_string(),
      consumed: None,
      fetched: None,
      exhausted: false,
    }
  }
}

/// A stream of items in feed order, readable from a position.
#[async_trait]
pub trait FeedSource: Send + Sync {
  fn id(&self) -> &str;

  /// Up to `limit` items strictly after `after` in feed order.
  async fn page(&self, after: Option<&FeedPosition>, limit: usize) -> Result<Vec<FeedItem>>;
}

/// Feed source backed by a store collection ordered by a timestamp field.
pub struct RemoteFeedSource {
  id: String,
  store: Arc<dyn RemoteStore>,
  collection: String,
  filters: Vec<Filter>,
  timestamp_field: String,
}

impl RemoteFeedSource {
  pub fn new(
    id: impl Into<String>,
    store: Arc<dyn RemoteStore>,
    collection: impl Into<String>,
    timestamp_field: impl Into<String>,
  ) -> Self {
    Self {
      id: id.into(),
      store,
      collection: collection.into(),
      filters: Vec::new(),
      timestamp_field: timestamp_field.into(),
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }
}

#[async_trait]
impl FeedSource for RemoteFeedSource {
  fn id(&self) -> &str {
    &self.id
  }

  async fn page(&self, after: Option<&FeedPosition>, limit: usize) -> Result<Vec<FeedItem>> {
    let mut query = Query::collection(self.collection.clone())
      .order_by(OrderBy::desc(self.timestamp_field.clone()))
      .limit(limit)
      .start_after(after.map(|pos| Cursor {
        values: vec![Value::from(pos.timestamp)],
        path: pos.id.clone(),
      }));
    query.filters = self.filters.clone();

    let docs = self.store.query(&query).await?;
    docs
      .into_iter()
      .map(|doc| {
        Ok(FeedItem {
          timestamp: doc.get_i64(&self.timestamp_field)?,
          id: doc.path,
          source: self.id.clone(),
          fields: doc.fields,
        })
      })
      .collect()
  }
}

struct SourceState {
  source: Arc<dyn FeedSource>,
  cursor: FeedCursor,
  buffer: VecDeque<FeedItem>,
}

impl SourceState {
  fn new(source: Arc<dyn FeedSource>) -> Self {
    Self {
      cursor: FeedCursor::new(source.id()),
      source,
      buffer: VecDeque::new(),
    }
  }

  /// Nothing buffered and nothing left to fetch.
  fn drained(&self) -> bool {
    self.cursor.exhausted && self.buffer.is_empty()
  }

  fn needs_fetch(&self) -> bool {
    !self.cursor.exhausted && self.buffer.is_empty()
  }
}

/// Merges several [`FeedSource`]s into pages of a single feed.
pub struct FeedAssembler {
  sources: Vec<SourceState>,
  page_size: usize,
  fan_out: usize,
  surfaced: HashSet<String>,
}

impl FeedAssembler {
  pub fn new(sources: Vec<Arc<dyn FeedSource>>, config: &FeedConfig) -> Self {
    Self {
      sources: sources.into_iter().map(SourceState::new).collect(),
      page_size: config.page_size.max(1),
      fan_out: config.fan_out.max(1),
      surfaced: HashSet::new(),
    }
  }

  /// Start the feed over and return its first page.
  ///
  /// Calling this again with no new remote data returns the same page.
  pub async fn load_window(&mut self, page_size: usize) -> Result<Vec<FeedItem>> {
    self.page_size = page_size.max(1);
    self.surfaced.clear();
    for state in &mut self.sources {
      state.cursor = FeedCursor::new(state.source.id());
      state.buffer.clear();
    }
    self.next_page().await
  }

  /// The page after the last one returned. Empty once every source is done.
  pub async fn load_more(&mut self) -> Result<Vec<FeedItem>> {
    self.next_page().await
  }

  pub fn cursors(&self) -> Vec<FeedCursor> {
    self.sources.iter().map(|s| s.cursor.clone()).collect()
  }

  /// Whether every source has been read to the end and fully surfaced.
  pub fn is_exhausted(&self) -> bool {
    self.sources.iter().all(SourceState::drained)
  }

  async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
    let mut page: Vec<(usize, FeedItem)> = Vec::with_capacity(self.page_size);

    while page.len() < self.page_size {
      if let Err(err) = self.fill().await {
        // Put the partial page back so a retry surfaces it again.
        for (idx, item) in page.into_iter().rev() {
          self.surfaced.remove(&item.id);
          self.sources[idx].buffer.push_front(item);
        }
        return Err(err);
      }

      // Every live source now has a head, so the newest head is safe to show.
      let Some(idx) = self.newest_head() else {
        break;
      };
      let Some(item) = self.sources[idx].buffer.pop_front() else {
        break;
      };
      if !self.surfaced.insert(item.id.clone()) {
        debug!(id = %item.id, "skipping item already surfaced by another source");
        continue;
      }
      page.push((idx, item));
    }

    let items: Vec<FeedItem> = page
      .into_iter()
      .map(|(idx, item)| {
        self.sources[idx].cursor.consumed = Some(item.position());
        item
      })
      .collect();
    debug!(items = items.len(), "assembled feed page");
    Ok(items)
  }

  fn newest_head(&self) -> Option<usize> {
    self
      .sources
      .iter()
      .enumerate()
      .filter_map(|(idx, s)| s.buffer.front().map(|item| (idx, item)))
      .min_by(|(_, a), (_, b)| feed_order(a, b))
      .map(|(idx, _)| idx)
  }

  /// Fetch a page for every source that still has data but nothing
  /// buffered, at most `fan_out` at a time.
  async fn fill(&mut self) -> Result<()> {
    let wanted: Vec<usize> = (0..self.sources.len())
      .filter(|&idx| self.sources[idx].needs_fetch())
      .collect();
    if wanted.is_empty() {
      return Ok(());
    }

    let limit = self.page_size;
    let fetches = wanted.into_iter().map(|idx| {
      let source = self.sources[idx].source.clone();
      let after = self.sources[idx].cursor.fetched.clone();
      async move { (idx, source.page(after.as_ref(), limit).await) }
    });
    let results: Vec<(usize, Result<Vec<FeedItem>>)> = stream::iter(fetches)
      .buffer_unordered(self.fan_out)
      .collect()
      .await;

    let mut first_error = None;
    for (idx, result) in results {
      let state = &mut self.sources[idx];
      match result {
        Ok(items) => {
          state.cursor.exhausted = items.len() < limit;
          if let Some(last) = items.last() {
            state.cursor.fetched = Some(last.position());
          }
          debug!(
            source = %state.cursor.source_id,
            fetched = items.len(),
            exhausted = state.cursor.exhausted,
            "fetched feed source page"
          );
          state.buffer.extend(items);
        }
        Err(err) => {
          warn!(source = %state.cursor.source_id, error = %err, "feed source fetch failed");
          first_error.get_or_insert(err);
        }
      }
    }
    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}
