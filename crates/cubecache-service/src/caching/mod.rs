//! # Blob caching
//!
//! Reading a cube means reading its manifest and a potentially large number of fragments from the
//! blob store, and the same fragments tend to be read over and over again. This module contains a
//! minimal cache abstraction that sits in front of the blob store and remembers recently fetched
//! blobs together with the validator (`ETag`) the store handed out for them.
//!
//! The cache is never a source of truth. Every read through the
//! [`BlobStorage`](crate::storage::BlobStorage) still goes to the origin, but presents the cached
//! validator, so unchanged blobs are answered with `304 Not Modified` and no payload transfer.
//!
//! ## Backends
//!
//! The [`BlobCache`] trait is deliberately tiny, consisting of only `set` and `get`. There are two
//! implementations, selected once from [`BlobCacheConfig`]:
//!
//! - [`InMemoryBlobCache`]: a bounded cache weighted by payload size. Admission and eviction are
//!   handled by `moka`, which uses a TinyLFU policy. Inserts may be rejected or evicted at any
//!   time.
//! - [`NoCache`]: never retains anything. Useful to disable caching for benchmarking, and as a
//!   reference of the minimal implementation.
//!
//! Tests are free to provide their own implementations.
//!
//! ### Metrics
//!
//! - `caches.blobs.size`: A histogram for the size (in bytes) of entries offered to the
//!   in-memory cache.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{BlobCacheConfig, CacheBackend};

mod cache_key;
mod memory;

pub use cache_key::CacheKey;
pub use memory::InMemoryBlobCache;

/// A blob payload as it was fetched from the origin.
///
/// If `etag` is set, it is the exact validator the origin returned together with `payload`.
/// Entries are never modified after creation, they are only ever replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn new(payload: impl Into<Bytes>, etag: Option<String>) -> Self {
        Self {
            payload: payload.into(),
            etag,
        }
    }
}

/// Minimal interface to a cache of blobs.
///
/// Implementations need to provide their own synchronization, a single instance is shared by all
/// concurrent requests. No ordering is guaranteed between a `set` and a `get` from another caller;
/// concurrent `set`s for the same key race, and the last write wins.
pub trait BlobCache: fmt::Debug + Send + Sync {
    /// Offers an entry to the cache.
    ///
    /// This is best-effort, the cache is free to drop the entry.
    fn set(&self, key: CacheKey, entry: CacheEntry);

    /// Looks up an entry, returning `None` if it was never stored or has since been evicted.
    ///
    /// No staleness check happens here, that is what conditional requests are for.
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;
}

/// A cache that never retains anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl BlobCache for NoCache {
    fn set(&self, _key: CacheKey, _entry: CacheEntry) {}

    fn get(&self, _key: &CacheKey) -> Option<CacheEntry> {
        None
    }
}

/// Creates the configured cache backend.
pub fn from_config(config: &BlobCacheConfig) -> Arc<dyn BlobCache> {
    match config.backend {
        CacheBackend::InMemory => {
            tracing::debug!(capacity = config.capacity, "Using in-memory blob cache");
            Arc::new(InMemoryBlobCache::new(config.capacity))
        }
        CacheBackend::Disabled => {
            tracing::debug!("Blob caching is disabled");
            Arc::new(NoCache)
        }
    }
}
