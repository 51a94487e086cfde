//! Client-side data layer for a document backend.
//!
//! - [`cache`]: memory + disk cache with a persistent, advisory index
//! - [`fetch`]: single-flight deduplication of remote reads
//! - [`mutation`]: optimistic counters with rollback
//! - [`feed`]: merged pagination over several sources
//! - [`spatial`]: debounced geohash viewport queries
//! - [`reconcile`]: periodic correction of drifted counters
//!
//! Components are constructed explicitly and shared through `Arc`; the crate
//! keeps no global state and never installs a tracing subscriber.

pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod mutation;
pub mod reconcile;
pub mod remote;
pub mod spatial;

pub use config::Config;
pub use error::{Error, Result};
