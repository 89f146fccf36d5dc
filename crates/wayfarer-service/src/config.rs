use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::DEFAULT_IGNORED_QUERY_PARAMS;

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
    /// The log level.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "wayfarer".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-memory (volatile) caches.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes) for the in-memory image cache.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `150 MiB (= 157_286_400)`.
    pub images_capacity: u64,

    /// Capacity (in bytes) for the in-memory video cache.
    ///
    /// Defaults to `300 MiB (= 314_572_800)`.
    pub videos_capacity: u64,

    /// Evict entries that have not been accessed for this long.
    ///
    /// Defaults to not expiring items by time at all.
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        let meg = 1024 * 1024;
        Self {
            images_capacity: 150 * meg,
            videos_capacity: 300 * meg,
            time_to_idle: None,
        }
    }
}

/// Configuration of the response cache of the HTTP transport.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TransportCacheConfig {
    /// Capacity (in bytes) of cached HTTP response bodies.
    ///
    /// Defaults to `50 MiB (= 52_428_800)`.
    pub capacity: u64,

    /// How long a cached response is served without going back to the server.
    ///
    /// Defaults to `1h`.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
}

impl Default for TransportCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50 * 1024 * 1024,
            time_to_live: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory caches.
    pub in_memory: InMemoryCacheConfig,

    /// Configuration of the HTTP transport response cache.
    pub transport: TransportCacheConfig,

    /// Query parameters of remote URLs that do not affect the identity of the content.
    ///
    /// Matching is case-insensitive, a trailing `*` matches by prefix.
    pub ignored_query_params: Vec<String>,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            in_memory: Default::default(),
            transport: Default::default(),
            ignored_query_params: DEFAULT_IGNORED_QUERY_PARAMS
                .iter()
                .map(|param| param.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the persistent caches. Default is not to persist anything.
    pub cache_dir: Option<PathBuf>,

    /// Directory of the device media library, if local assets are served from the filesystem.
    pub library_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the caches.
    pub caches: CacheConfigs,

    /// The timeout for establishing a connection to a remote asset host.
    ///
    /// `0s` disables the timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum timeout for downloading a single remote asset.
    ///
    /// `0s` disables the timeout.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The `User-Agent` sent with remote requests.
    pub user_agent: String,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            library_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(60),
            user_agent: concat!("wayfarer/", env!("CARGO_PKG_VERSION")).to_owned(),
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

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
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
