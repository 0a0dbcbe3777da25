use std::time::Duration;

use crate::config::Config;

/// Various timeouts for downloads from the blob store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Fails only if the TLS backend cannot be initialized.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
