use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "cubecache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which implementation backs the blob cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// A bounded, cost-aware in-memory cache.
    InMemory,
    /// Caching is disabled, every read goes to the origin.
    Disabled,
}

/// Configuration of the blob (fragment and manifest) cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct BlobCacheConfig {
    /// The cache implementation.
    ///
    /// Defaults to `in_memory`.
    pub backend: CacheBackend,

    /// Capacity (in bytes) of the in-memory cache.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `2 GiB (= 2_147_483_648)`.
    pub capacity: u64,
}

impl Default for BlobCacheConfig {
    fn default() -> Self {
        let meg = 1024 * 1024;
        Self {
            backend: CacheBackend::InMemory,
            capacity: 2 * 1024 * meg,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure the cache in front of the blob store.
    pub blobs: BlobCacheConfig,
}

/// Configuration of the cube fetch service.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Cache configuration.
    pub caches: CacheConfigs,

    /// The maximum timeout for a single blob download.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection to the blob store.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers of a download.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            caches: CacheConfigs::default(),
            max_download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
