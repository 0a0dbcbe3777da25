//! Reading blobs from the blob store, through the blob cache.
//!
//! The [`StorageClient`] is the interface the rest of the system uses to read manifests and
//! fragments. [`BlobStorage`] implements it on top of an [`HttpOrigin`] and a [`BlobCache`]:
//!
//! - Every read goes to the origin. If the blob is cached, the request is conditional on the cached
//!   `ETag`, and a `304 Not Modified` is answered with the cached payload.
//! - A blob that was not cached is returned right away, and offered to the cache by a detached
//!   task afterwards.
//! - A cached blob that comes back with a full, fresh payload means the blob was modified at the
//!   origin while we had it cached. This must not happen in a healthy system, so instead of serving
//!   either version, the read fails with an internal error and the incident is logged.
//!
//! Origin errors are translated into [`StorageError`]s here, and nowhere else.
//!
//! ### Metrics
//!
//! - `storage.cache`: Cache lookups, tagged with `result:hit` or `result:miss`.
//! - `storage.get`: Reads, tagged with the outcome `status`.
//! - `storage.etag_mismatch`: Cached blobs that were modified at the origin.
//! - `storage.download`: A timer of the origin requests, tagged with the response `status`.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::runtime::Handle;
use url::Url;

use crate::caching::{self, BlobCache, CacheEntry, CacheKey};
use crate::config::Config;
use crate::download::{HttpOrigin, error_kind, unpack_blob_error};
use crate::utils::http::{DownloadTimeouts, create_client};

mod error;

pub use error::StorageError;

/// Minimal interface for reading blobs from storage.
///
/// This hides the details of the underlying storage from the rest of the system, making it
/// possible to swap out the storage provider, or to substitute it in tests.
pub trait StorageClient: Send + Sync {
    /// Reads the full contents of the blob at `url`.
    ///
    /// Dropping the returned future cancels the read.
    fn get(&self, url: &Url) -> impl Future<Output = Result<Bytes, StorageError>> + Send;
}

impl<S: StorageClient> StorageClient for &S {
    fn get(&self, url: &Url) -> impl Future<Output = Result<Bytes, StorageError>> + Send {
        (**self).get(url)
    }
}

impl<S: StorageClient> StorageClient for Arc<S> {
    fn get(&self, url: &Url) -> impl Future<Output = Result<Bytes, StorageError>> + Send {
        (**self).get(url)
    }
}

/// A [`StorageClient`] reading from an HTTP blob store with a validating cache.
///
/// A single instance is meant to be shared by all requests.
#[derive(Clone, Debug)]
pub struct BlobStorage {
    cache: Arc<dyn BlobCache>,
    origin: HttpOrigin,
    /// The runtime that cache writes are spawned on.
    runtime: Handle,
}

impl BlobStorage {
    pub fn new(cache: Arc<dyn BlobCache>, origin: HttpOrigin, runtime: Handle) -> Self {
        Self {
            cache,
            origin,
            runtime,
        }
    }

    /// Creates the storage client, and the cache backend selected in `config`.
    pub fn from_config(config: &Config, runtime: Handle) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts).context("failed to create HTTP client")?;
        let cache = caching::from_config(&config.caches.blobs);

        Ok(Self::new(cache, HttpOrigin::new(client, timeouts), runtime))
    }

    async fn load(&self, url: &Url) -> Result<Bytes, StorageError> {
        if url.cannot_be_a_base() || url.host_str().is_none() {
            tracing::error!("Refusing to read `{}`, it does not point to a blob", url.scheme());
            return Err(StorageError::InternalError);
        }

        let key = CacheKey::from_url(url);
        let cached = self.cache.get(&key);
        metric!(
            counter("storage.cache") += 1,
            "result" => if cached.is_some() { "hit" } else { "miss" },
        );

        let etag = cached.as_ref().and_then(|entry| entry.etag.as_deref());
        match self.origin.download(url, etag).await {
            Ok(fresh) => self.fresh_payload(key, cached, fresh),
            Err(error) => translate_error(url, &key, cached, error),
        }
    }

    /// Handles a successful, unconditional response.
    fn fresh_payload(
        &self,
        key: CacheKey,
        cached: Option<CacheEntry>,
        fresh: CacheEntry,
    ) -> Result<Bytes, StorageError> {
        if let Some(cached) = cached {
            // The origin would have said `304 Not Modified` for an unchanged blob. So the blob was
            // modified since we cached it, which must be investigated.
            tracing::error!(
                cached_etag = cached.etag.as_deref(),
                fresh_etag = fresh.etag.as_deref(),
                "ETag expired for `{}`; investigate immediately",
                key,
            );
            metric!(counter("storage.etag_mismatch") += 1);
            return Err(StorageError::InternalError);
        }

        let payload = fresh.payload.clone();
        if fresh.etag.is_some() {
            let cache = Arc::clone(&self.cache);
            self.runtime.spawn(async move { cache.set(key, fresh) });
        } else {
            // Without a validator, the entry could never be revalidated.
            tracing::debug!("Not caching `{}`, the response has no ETag", key);
        }

        Ok(payload)
    }
}

impl StorageClient for BlobStorage {
    async fn get(&self, url: &Url) -> Result<Bytes, StorageError> {
        let result = self.load(url).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_tag(),
        };
        metric!(counter("storage.get") += 1, "status" => status);

        result
    }
}

/// Translates a failed download into a [`StorageError`].
///
/// `304 Not Modified` is not a failure, it is answered with the `cached` payload.
fn translate_error(
    url: &Url,
    key: &CacheKey,
    cached: Option<CacheEntry>,
    error: anyhow::Error,
) -> Result<Bytes, StorageError> {
    let error = match unpack_blob_error(error) {
        Ok(error) => error,
        Err(error) => {
            tracing::error!(
                kind = error_kind(&error),
                "Unhandled error while fetching `{}`: {:#}",
                key,
                error,
            );
            return Err(StorageError::InternalError);
        }
    };

    match error.status {
        StatusCode::NOT_MODIFIED => match cached {
            Some(cached) => {
                tracing::trace!("`{}` not modified, serving cached payload", key);
                Ok(cached.payload)
            }
            None => {
                tracing::error!("Unexpected `304 Not Modified` for uncached `{}`", key);
                Err(StorageError::InternalError)
            }
        },
        StatusCode::NOT_FOUND => Err(StorageError::not_found(url)),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            tracing::debug!("Insufficient permissions to read `{}`: {}", key, error.status);
            Err(StorageError::permission_denied(error.status))
        }
        status => {
            tracing::error!(
                status = %status,
                code = error.code.as_deref(),
                message = error.message.as_deref(),
                "Unhandled blob store error while fetching `{}`",
                key,
            );
            Err(StorageError::InternalError)
        }
    }
}
