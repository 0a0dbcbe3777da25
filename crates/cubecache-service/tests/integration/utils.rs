use std::sync::Arc;
use std::time::Duration;

use cubecache_service::caching::{BlobCache, CacheKey, InMemoryBlobCache};
use cubecache_service::download::HttpOrigin;
use cubecache_service::storage::BlobStorage;
use cubecache_service::utils::http::{DownloadTimeouts, create_client};
use url::Url;

/// Creates a storage client with an in-memory cache, also returning the cache for inspection.
pub fn setup_storage() -> (BlobStorage, Arc<InMemoryBlobCache>) {
    cubecache_test::setup();

    let cache = Arc::new(InMemoryBlobCache::new(16 * 1024 * 1024));
    let timeouts = DownloadTimeouts::default();
    let origin = HttpOrigin::new(create_client(&timeouts).unwrap(), timeouts);
    let storage = BlobStorage::new(cache.clone(), origin, tokio::runtime::Handle::current());

    (storage, cache)
}

/// Waits until the blob at `url` shows up in `cache`.
///
/// Cache writes happen in the background after a read completed.
pub async fn wait_until_cached(cache: &dyn BlobCache, url: &Url) {
    let key = CacheKey::from_url(url);
    for _ in 0..100 {
        if cache.get(&key).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("`{key}` was never cached");
}
