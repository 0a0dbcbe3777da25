//! Conditional downloads of single blobs from the blob store.
//!
//! The origin speaks the Azure Blob Storage flavour of HTTP: a plain `GET` on the blob URL, with
//! authorization carried in the query string (SAS tokens). Conditional requests use `If-None-Match`
//! with the `ETag` of a previous response and are answered with `304 Not Modified` if the blob is
//! unchanged.

use std::time::Instant;

use anyhow::Context;
use reqwest::{Client, header};
use url::{Position, Url};

use crate::caching::CacheEntry;
use crate::utils::http::DownloadTimeouts;

mod error;

pub use error::{BlobStoreError, error_kind, unpack_blob_error};

/// The storage REST API version requested from the blob store.
const STORAGE_API_VERSION: &str = "2020-10-02";

pub const USER_AGENT: &str = concat!("cubecache/", env!("CARGO_PKG_VERSION"));

/// Downloads blobs over HTTP.
#[derive(Clone, Debug)]
pub struct HttpOrigin {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpOrigin {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Downloads the blob at `url`.
    ///
    /// If `etag` is given, the request is conditional and an unchanged blob results in a
    /// [`BlobStoreError`] with status `304 Not Modified`.
    ///
    /// Any non-successful response is returned as a [`BlobStoreError`] wrapped in context, all
    /// other failures (connection problems, timeouts, ...) are returned as they come. The whole
    /// download is aborted after [`DownloadTimeouts::max_download`], or when the returned future
    /// is dropped.
    pub async fn download(&self, url: &Url, etag: Option<&str>) -> anyhow::Result<CacheEntry> {
        let timeout = self.timeouts.max_download;
        let start = Instant::now();

        let result = tokio::time::timeout(timeout, self.do_download(url, etag))
            .await
            .with_context(|| {
                let location = redacted(url);
                format!("download of `{location}` timed out after {timeout:?}")
            })
            .and_then(|result| result);

        let status = match &result {
            Ok(_) => "ok",
            Err(error) => match error.downcast_ref::<BlobStoreError>() {
                Some(e) => e.status.as_str(),
                None => error_kind(error),
            },
        };
        metric!(timer("storage.download") = start.elapsed(), "status" => status);

        result
    }

    async fn do_download(&self, url: &Url, etag: Option<&str>) -> anyhow::Result<CacheEntry> {
        let mut builder = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .header("x-ms-version", STORAGE_API_VERSION);
        if let Some(etag) = etag {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }

        let location = redacted(url);
        tracing::trace!(conditional = etag.is_some(), "Fetching blob `{}`", location);

        let response = tokio::time::timeout(self.timeouts.head, builder.send())
            .await
            .with_context(|| format!("no response from `{location}` within {:?}", self.timeouts.head))?
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to request `{location}`"))?;

        let status = response.status();
        if !status.is_success() {
            tracing::trace!("Unsuccessful response from `{}`: {}", location, status);
            let error = BlobStoreError::from_response(response).await;
            return Err(anyhow::Error::new(error).context(format!("failed to download `{location}`")));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let payload = response
            .bytes()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to read body of `{location}`"))?;

        Ok(CacheEntry { payload, etag })
    }
}

/// The URL without its query, which carries access tokens that must not end up in logs.
fn redacted(url: &Url) -> &str {
    &url[..Position::AfterPath]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cubecache_test::BlobServer;
    use reqwest::StatusCode;

    use super::*;
    use crate::utils::http::create_client;

    fn origin(timeouts: DownloadTimeouts) -> HttpOrigin {
        HttpOrigin::new(create_client(&timeouts).unwrap(), timeouts)
    }

    #[tokio::test]
    async fn test_download_fresh() {
        cubecache_test::setup();

        let server = BlobServer::new();
        server.put("cube/manifest.json", "{}", "\"0x1\"");

        let entry = origin(Default::default())
            .download(&server.blob_url("cube/manifest.json"), None)
            .await
            .unwrap();

        assert_eq!(entry, CacheEntry::new("{}", Some("\"0x1\"".into())));

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].if_none_match, None);
    }

    #[tokio::test]
    async fn test_download_not_modified() {
        cubecache_test::setup();

        let server = BlobServer::new();
        server.put("cube/manifest.json", "{}", "\"0x1\"");

        let error = origin(Default::default())
            .download(&server.blob_url("cube/manifest.json"), Some("\"0x1\""))
            .await
            .unwrap_err();

        let error = unpack_blob_error(error).unwrap();
        assert_eq!(error.status, StatusCode::NOT_MODIFIED);

        let requests = server.requests();
        assert_eq!(requests[0].if_none_match.as_deref(), Some("\"0x1\""));
    }

    #[tokio::test]
    async fn test_download_changed() {
        cubecache_test::setup();

        let server = BlobServer::new();
        server.put("cube/manifest.json", "{\"v\":2}", "\"0x2\"");

        let entry = origin(Default::default())
            .download(&server.blob_url("cube/manifest.json"), Some("\"0x1\""))
            .await
            .unwrap();

        assert_eq!(entry.etag.as_deref(), Some("\"0x2\""));
        assert_eq!(&entry.payload[..], b"{\"v\":2}");
    }

    #[tokio::test]
    async fn test_download_missing() {
        cubecache_test::setup();

        let server = BlobServer::new();
        let error = origin(Default::default())
            .download(&server.blob_url("cube/i-do-not-exist"), None)
            .await
            .unwrap_err();

        let error = unpack_blob_error(error).unwrap();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code.as_deref(), Some("BlobNotFound"));
        assert_eq!(
            error.message.as_deref(),
            Some("The specified blob does not exist.")
        );
    }

    #[tokio::test]
    async fn test_download_forbidden() {
        cubecache_test::setup();

        let server = BlobServer::new();
        let error = origin(Default::default())
            .download(&server.url("respond_statuscode/403/cube/manifest.json"), None)
            .await
            .unwrap_err();

        let error = unpack_blob_error(error).unwrap();
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.code.as_deref(), Some("AuthorizationFailure"));
    }

    #[tokio::test]
    async fn test_download_timeout() {
        cubecache_test::setup();

        let server = BlobServer::new();
        server.put("slow", "payload", "\"0x1\"");

        let timeouts = DownloadTimeouts {
            max_download: Duration::from_millis(100),
            ..Default::default()
        };
        let error = origin(timeouts)
            .download(&server.url("delay/1s/slow"), None)
            .await
            .unwrap_err();

        assert_eq!(error_kind(&error), "timeout");
        assert!(unpack_blob_error(error).is_err());
    }

    #[test]
    fn test_redacted() {
        let url = "https://account.blob.core.windows.net/cube/manifest.json?sv=2020&sig=secret"
            .parse()
            .unwrap();
        assert_eq!(
            redacted(&url),
            "https://account.blob.core.windows.net/cube/manifest.json"
        );
    }
}
