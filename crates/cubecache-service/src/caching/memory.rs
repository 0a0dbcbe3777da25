use std::fmt;

use super::{BlobCache, CacheEntry, CacheKey};

type InMemoryCache = moka::sync::Cache<CacheKey, CacheEntry>;

/// A bounded in-memory [`BlobCache`].
///
/// The capacity is given in bytes and is a best-effort approximation. Entries are weighted by their
/// payload size, and `moka` decides which entries to admit and which to evict.
#[derive(Clone)]
pub struct InMemoryBlobCache {
    cache: InMemoryCache,
}

impl fmt::Debug for InMemoryBlobCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBlobCache")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl InMemoryBlobCache {
    pub fn new(capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("blobs")
            // NOTE: we count the key and the bookkeeping structures to the weight as well
            .weigher(|k: &CacheKey, v: &CacheEntry| {
                let size = v.payload.len()
                    + v.etag.as_ref().map_or(0, String::len)
                    + k.as_str().len()
                    + std::mem::size_of::<(CacheKey, CacheEntry)>();
                size.try_into().unwrap_or(u32::MAX)
            })
            .build();

        Self { cache }
    }
}

impl BlobCache for InMemoryBlobCache {
    fn set(&self, key: CacheKey, entry: CacheEntry) {
        metric!(histogram("caches.blobs.size") = entry.payload.len() as u64);
        self.cache.insert(key, entry);
    }

    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.cache.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from_url(&s.parse().unwrap())
    }

    #[test]
    fn test_missing_key() {
        let cache = InMemoryBlobCache::new(1024 * 1024);
        assert_eq!(cache.get(&key("http://h/never-set")), None);
    }

    #[test]
    fn test_set_then_get() {
        let cache = InMemoryBlobCache::new(1024 * 1024);
        let k = key("http://h/cube/src/0-0-0.f32");
        let entry = CacheEntry::new(vec![1u8, 2, 3, 4], Some("\"0x8D9\"".into()));

        cache.set(k.clone(), entry.clone());
        assert_eq!(cache.get(&k), Some(entry));
        assert_eq!(cache.get(&key("http://h/cube/src/0-0-1.f32")), None);
    }

    #[test]
    fn test_replaces_wholesale() {
        let cache = InMemoryBlobCache::new(1024 * 1024);
        let k = key("http://h/cube/manifest.json");

        cache.set(k.clone(), CacheEntry::new("old", Some("\"1\"".into())));
        let new = CacheEntry::new("new", Some("\"2\"".into()));
        cache.set(k.clone(), new.clone());

        assert_eq!(cache.get(&k), Some(new));
    }

    #[test]
    fn test_shared_between_clones() {
        let cache = InMemoryBlobCache::new(1024 * 1024);
        let other = cache.clone();
        let k = key("http://h/p");
        let entry = CacheEntry::new("payload", Some("\"1\"".into()));

        std::thread::spawn(move || other.set(k, entry)).join().unwrap();

        assert_eq!(
            cache.get(&key("http://h/p?sig=other")).map(|e| e.payload),
            Some(bytes::Bytes::from("payload"))
        );
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = InMemoryBlobCache::new(64 * 1024);
        for i in 0..256 {
            let k = key(&format!("http://h/fragment/{i}"));
            cache.set(k, CacheEntry::new(vec![0u8; 4096], Some(format!("\"{i}\""))));
        }
        cache.cache.run_pending_tasks();

        assert!(cache.cache.weighted_size() <= 64 * 1024);
        assert!(cache.cache.entry_count() < 256);
    }
}
