use std::fmt;
use std::sync::Arc;

use url::Url;

/// The key of a blob in the [`BlobCache`](super::BlobCache).
///
/// The key consists of the host (including an explicit port) and the path of the blob URL, formatted
/// as `<host>/<path>`. The query string is not part of the key, so any access token passed that
/// way does not partition the cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a [`CacheKey`] from the host and path of the given URL.
    pub fn from_url(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default();
        let path = url.path().trim_start_matches('/');
        let key = match url.port() {
            Some(port) => format!("{host}:{port}/{path}"),
            None => format!("{host}/{path}"),
        };
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
