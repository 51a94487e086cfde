//! Abstraction over the remote document backend.
//!
//! Documents are addressed by slash-separated paths (`posts/p1`,
//! `posts/p1/likes/u7`). A collection path is a document path without its last
//! segment. Pagination is cursor-keyed: a query resumes *after* the order-by
//! values and id of the last document seen, which stays stable when new documents
//! are inserted concurrently.

mod cached;
mod memory;

pub use cached::CachedStore;
pub use memory::{MemoryStore, Operation};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::cache::Cacheable;
use crate::error::{Error, Result};

/// Field map of a document.
pub type Fields = serde_json::Map<String, Value>;

/// A document as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub path: String,
  pub fields: Fields,
  pub update_time: DateTime<Utc>,
}

impl Document {
  pub fn new(path: impl Into<String>, fields: Fields) -> Self {
    Self {
      path: path.into(),
      fields,
      update_time: Utc::now(),
    }
  }

  /// Last path segment.
  pub fn id(&self) -> &str {
    self.path.rsplit('/').next().unwrap_or(&self.path)
  }

  /// Path of the collection holding this document.
  pub fn collection(&self) -> &str {
    collection_of(&self.path)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }

  /// Integer field; a missing field reads as zero.
  pub fn get_i64(&self, field: &str) -> Result<i64> {
    match self.fields.get(field) {
      None | Some(Value::Null) => Ok(0),
      Some(v) => v.as_i64().ok_or_else(|| Error::InvalidDocument {
        path: self.path.clone(),
        reason: format!("field {} is not an integer", field),
      }),
    }
  }

  pub fn get_f64(&self, field: &str) -> Result<f64> {
    self
      .fields
      .get(field)
      .and_then(Value::as_f64)
      .ok_or_else(|| Error::InvalidDocument {
        path: self.path.clone(),
        reason: format!("field {} is missing or not a number", field),
      })
  }

  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.fields.get(field).and_then(Value::as_str)
  }
}

impl Cacheable for Document {
  fn cache_key(&self) -> String {
    self.path.clone()
  }

  fn version(&self) -> Option<String> {
    Some(self.update_time.to_rfc3339())
  }

  fn entity_type() -> &'static str {
    "document"
  }
}

/// Collection part of a document path (`posts/p1` -> `posts`).
pub fn collection_of(path: &str) -> &str {
  path.rsplit_once('/').map(|(c, _)| c).unwrap_or("")
}

/// Comparison operator of a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
  Eq,
  Lt,
  Le,
  Gt,
  Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl Filter {
  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op: FilterOp::Eq,
      value: value.into(),
    }
  }

  pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op: FilterOp::Ge,
      value: value.into(),
    }
  }

  pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op: FilterOp::Lt,
      value: value.into(),
    }
  }

  /// Whether `doc` passes this filter. Missing fields never match.
  pub fn matches(&self, doc: &Document) -> bool {
    let Some(actual) = doc.get(&self.field) else {
      return false;
    };
    let ord = compare_values(actual, &self.value);
    match self.op {
      FilterOp::Eq => ord == Ordering::Equal,
      FilterOp::Lt => ord == Ordering::Less,
      FilterOp::Le => ord != Ordering::Greater,
      FilterOp::Gt => ord == Ordering::Greater,
      FilterOp::Ge => ord != Ordering::Less,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

impl OrderBy {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Ascending,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Descending,
    }
  }
}

/// Position marker for cursor pagination: the order-by values of the last
/// document seen plus its path as the final tie-break.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
  pub values: Vec<Value>,
  pub path: String,
}

impl Cursor {
  /// Cursor positioned at `doc` for the given ordering.
  pub fn at(doc: &Document, order_by: &[OrderBy]) -> Self {
    Self {
      values: order_by
        .iter()
        .map(|o| doc.get(&o.field).cloned().unwrap_or(Value::Null))
        .collect(),
      path: doc.path.clone(),
    }
  }
}

/// A collection query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub collection: String,
  pub filters: Vec<Filter>,
  pub order_by: Vec<OrderBy>,
  pub limit: Option<usize>,
  pub start_after: Option<Cursor>,
}

impl Query {
  pub fn collection(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      filters: Vec::new(),
      order_by: Vec::new(),
      limit: None,
      start_after: None,
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, order: OrderBy) -> Self {
    self.order_by.push(order);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
    self.start_after = cursor;
    self
  }

  /// Total order used by the query: the order-by fields, then the document
  /// path in the direction of the last order-by (ascending when unordered).
  pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
    self.compare_positions(&Cursor::at(a, &self.order_by), &Cursor::at(b, &self.order_by))
  }

  fn compare_positions(&self, a: &Cursor, b: &Cursor) -> Ordering {
    for (i, order) in self.order_by.iter().enumerate() {
      let null = Value::Null;
      let ord = compare_values(a.values.get(i).unwrap_or(&null), b.values.get(i).unwrap_or(&null));
      let ord = match order.direction {
        Direction::Ascending => ord,
        Direction::Descending => ord.reverse(),
      };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    let tie = a.path.cmp(&b.path);
    match self.order_by.last().map(|o| o.direction) {
      Some(Direction::Descending) => tie.reverse(),
      _ => tie,
    }
  }

  /// Whether `doc` sorts strictly after the cursor.
  pub fn is_after_cursor(&self, doc: &Document) -> bool {
    match &self.start_after {
      None => true,
      Some(cursor) => {
        self.compare_positions(&Cursor::at(doc, &self.order_by), cursor) == Ordering::Greater
      }
    }
  }
}

/// Ordering over JSON values: null < bool < number < string < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
  fn rank(v: &Value) -> u8 {
    match v {
      Value::Null => 0,
      Value::Bool(_) => 1,
      Value::Number(_) => 2,
      Value::String(_) => 3,
      Value::Array(_) | Value::Object(_) => 4,
    }
  }

  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Number(x), Value::Number(y)) => {
      match (x.as_i64(), y.as_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
          let x = x.as_f64().unwrap_or(f64::NAN);
          let y = y.as_f64().unwrap_or(f64::NAN);
          x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
      }
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)),
  }
}

/// Read-modify-write body of a transaction. Receives the current document (if
/// any) and returns the fields to merge into it.
pub type TransactionFn = Box<dyn FnOnce(Option<&Document>) -> Result<Fields> + Send>;

/// Backend primitives the subsystem relies on.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Fetch one document. Unknown paths yield [`Error::NotFound`].
  async fn get(&self, path: &str) -> Result<Document>;

  /// Merge `fields` into the document at `path`, creating it if needed.
  async fn put(&self, path: &str, fields: Fields) -> Result<Document>;

  async fn delete(&self, path: &str) -> Result<()>;

  /// Run a collection query. Results honour `order_by`, `start_after` and `limit`.
  async fn query(&self, query: &Query) -> Result<Vec<Document>>;

  /// Atomically read the document at `path`, compute new fields and write them.
  async fn run_transaction(&self, path: &str, update: TransactionFn) -> Result<Document>;

  /// Atomically add `delta` to an integer field and return the new value.
  async fn increment(&self, path: &str, field: &str, delta: i64) -> Result<i64> {
    let name = field.to_string();
    let doc_path = path.to_string();
    let doc = self
      .run_transaction(
        path,
        Box::new(move |current| {
          let value = match current {
            Some(doc) => doc.get_i64(&name)?,
            None => 0,
          };
          let mut fields = Fields::new();
          fields.insert(name, Value::from(value + delta));
          Ok(fields)
        }),
      )
      .await?;
    doc.get_i64(field).map_err(|_| Error::InvalidDocument {
      path: doc_path,
      reason: format!("field {} missing after increment", field),
    })
  }

  /// Number of documents matching `query`, ignoring its limit.
  async fn count(&self, query: &Query) -> Result<u64> {
    let mut pages = Paginator::new(query.clone(), COUNT_PAGE_SIZE);
    let mut total = 0u64;
    while let Some(page) = pages.next_page(self).await? {
      total += page.len() as u64;
    }
    Ok(total)
  }
}

const COUNT_PAGE_SIZE: usize = 500;

/// Walks a query page by page with cursor pagination.
#[derive(Debug, Clone)]
pub struct Paginator {
  query: Query,
  page_size: usize,
  done: bool,
}

impl Paginator {
  pub fn new(query: Query, page_size: usize) -> Self {
    Self {
      query,
      page_size: page_size.max(1),
      done: false,
    }
  }

  /// Fetch the next page, or `None` once the query is exhausted.
  pub async fn next_page<S: RemoteStore + ?Sized>(
    &mut self,
    store: &S,
  ) -> Result<Option<Vec<Document>>> {
    if self.done {
      return Ok(None);
    }

    let query = self.query.clone().limit(self.page_size);
    let docs = store.query(&query).await?;

    if docs.len() < self.page_size {
      self.done = true;
    }
    match docs.last() {
      Some(last) => {
        self.query.start_after = Some(Cursor::at(last, &self.query.order_by));
        Ok(Some(docs))
      }
      None => {
        self.done = true;
        Ok(None)
      }
    }
  }

  /// Cursor after the last document returned so far.
  pub fn cursor(&self) -> Option<&Cursor> {
    self.query.start_after.as_ref()
  }
}
