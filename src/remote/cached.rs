//! Remote store wrapper with transparent document caching.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Document, Fields, Query, RemoteStore, TransactionFn};
use crate::cache::{CacheResult, CachedFetcher, TieredCache};
use crate::error::Result;

/// Remote store with transparent caching support.
///
/// This wraps another [`RemoteStore`] and exposes the same API. Document
/// reads are served from the tiered cache and deduplicated while in flight;
/// writes go straight to the backend and refresh the cached copy with what
/// the backend returned.
#[derive(Clone)]
pub struct CachedStore {
  inner: Arc<dyn RemoteStore>,
  documents: CachedFetcher<Document>,
}

impl CachedStore {
  pub fn new(inner: Arc<dyn RemoteStore>, cache: Arc<TieredCache<Document>>) -> Self {
    Self {
      inner,
      documents: CachedFetcher::new(cache),
    }
  }

  /// The uncached backend.
  pub fn inner(&self) -> &Arc<dyn RemoteStore> {
    &self.inner
  }

  pub fn cache(&self) -> &Arc<TieredCache<Document>> {
    self.documents.cache()
  }

  /// Get a document with its provenance (network, memory, disk).
  pub async fn get_with_source(&self, path: &str) -> Result<CacheResult<Document>> {
    let inner = self.inner.clone();
    let owned = path.to_string();
    self
      .documents
      .get(path, move || async move { inner.get(&owned).await })
      .await
  }

  /// Re-read a document from the backend, falling back to the cached copy
  /// when the backend is unreachable.
  pub async fn refresh(&self, path: &str) -> Result<CacheResult<Document>> {
    let inner = self.inner.clone();
    let owned = path.to_string();
    self
      .documents
      .refresh(path, move || async move { inner.get(&owned).await })
      .await
  }
}

#[async_trait]
impl RemoteStore for CachedStore {
  async fn get(&self, path: &str) -> Result<Document> {
    Ok(self.get_with_source(path).await?.data)
  }

  async fn put(&self, path: &str, fields: Fields) -> Result<Document> {
    let doc = self.inner.put(path, fields).await?;
    self.cache().put(doc.clone()).await;
    Ok(doc)
  }

  async fn delete(&self, path: &str) -> Result<()> {
    self.inner.delete(path).await?;
    self.cache().invalidate(path).await;
    Ok(())
  }

  /// Queries always hit the backend; the documents they return refresh the
  /// cache so later point reads are free.
  async fn query(&self, query: &Query) -> Result<Vec<Document>> {
    let docs = self.inner.query(query).await?;
    for doc in &docs {
      self.cache().put(doc.clone()).await;
    }
    Ok(docs)
  }

  async fn run_transaction(&self, path: &str, update: TransactionFn) -> Result<Document> {
    let doc = self.inner.run_transaction(path, update).await?;
    self.cache().put(doc.clone()).await;
    Ok(doc)
  }

  async fn count(&self, query: &Query) -> Result<u64> {
    self.inner.count(query).await
  }
}
