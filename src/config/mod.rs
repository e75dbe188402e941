//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup and fails fast on missing or unparseable values.
//! The API token is wrapped in `secrecy::SecretString` so it never shows up
//! in logs or `Debug` output. Environment variables win over the file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::queue::QueueConfig;
use crate::telemetry::TelemetryConfig;

/// Largest page the reactions endpoint returns per call.
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
}

/// Remote API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://discord.com/api/v9`.
    pub base_url: String,
    /// Opaque token supplied by the host, sent as the `Authorization` header.
    pub token: Option<SecretString>,
    /// Users requested per population fetch (1..=100).
    pub page_limit: u32,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            page_limit: MAX_PAGE_LIMIT,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// On-disk layout. Every field is optional; missing ones keep defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    api: ApiSection,
    #[serde(default)]
    queue: QueueSection,
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApiSection {
    base_url: Option<String>,
    token: Option<String>,
    page_limit: Option<u32>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueueSection {
    cooldown_ms: Option<u64>,
    max_pending: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheSection {
    capacity: Option<usize>,
    retry_after_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TelemetrySection {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

/// Settings gathered from all sources before validation.
#[derive(Debug, Default)]
struct Layered {
    base_url: Option<String>,
    token: Option<String>,
    page_limit: Option<u32>,
    request_timeout_secs: Option<u64>,
    cooldown_ms: Option<u64>,
    max_pending: Option<usize>,
    capacity: Option<usize>,
    retry_after_secs: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Layered {
    fn from_file(file: FileConfig) -> Self {
        Self {
            base_url: file.api.base_url,
            token: file.api.token,
            page_limit: file.api.page_limit,
            request_timeout_secs: file.api.request_timeout_secs,
            cooldown_ms: file.queue.cooldown_ms,
            max_pending: file.queue.max_pending,
            capacity: file.cache.capacity,
            retry_after_secs: file.cache.retry_after_secs,
            otel_endpoint: file.telemetry.otel_endpoint,
            log_level: file.telemetry.log_level,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        override_with(&mut self.base_url, env_var("ENRICHQ_API_BASE"));
        override_with(&mut self.token, env_var("ENRICHQ_API_TOKEN"));
        override_with(&mut self.page_limit, parse_var("ENRICHQ_PAGE_LIMIT")?);
        override_with(
            &mut self.request_timeout_secs,
            parse_var("ENRICHQ_REQUEST_TIMEOUT_SECS")?,
        );
        override_with(&mut self.cooldown_ms, parse_var("ENRICHQ_COOLDOWN_MS")?);
        override_with(&mut self.max_pending, parse_var("ENRICHQ_MAX_PENDING")?);
        override_with(&mut self.capacity, parse_var("ENRICHQ_CACHE_CAPACITY")?);
        override_with(&mut self.retry_after_secs, parse_var("ENRICHQ_RETRY_AFTER_SECS")?);
        override_with(&mut self.otel_endpoint, env_var("OTEL_ENDPOINT"));
        override_with(&mut self.log_level, env_var("LOG_LEVEL"));
        Ok(())
    }

    fn build(self) -> Result<Config> {
        let base_url = self
            .base_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("api base url is not set (ENRICHQ_API_BASE or [api].base_url)".into())
            })?;

        let mut api = ApiConfig::new(base_url.trim_end_matches('/'));
        api.token = self.token.map(SecretString::from);
        if let Some(limit) = self.page_limit {
            if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
                return Err(Error::Config(format!(
                    "page limit must be between 1 and {MAX_PAGE_LIMIT}, got {limit}"
                )));
            }
            api.page_limit = limit;
        }
        if let Some(secs) = self.request_timeout_secs {
            api.request_timeout = Duration::from_secs(secs);
        }

        let mut queue = QueueConfig::default();
        if let Some(ms) = self.cooldown_ms {
            queue.cooldown = Duration::from_millis(ms);
        }
        queue.max_pending = self.max_pending;

        let cache = CacheConfig {
            capacity: self.capacity,
            retry_after: self.retry_after_secs.map(Duration::from_secs),
        };

        let mut telemetry = TelemetryConfig {
            endpoint: self.otel_endpoint,
            ..TelemetryConfig::default()
        };
        if let Some(level) = self.log_level {
            telemetry.log_level = level;
        }

        Ok(Config {
            api,
            queue,
            cache,
            telemetry,
        })
    }
}

impl Config {
    /// Load configuration from environment variables only.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut layered = Layered::default();
        layered.apply_env()?;
        layered.build()
    }

    /// Parse a TOML document. Environment variables are not consulted.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))?;
        Layered::from_file(file).build()
    }

    /// Read a TOML file, then let environment variables override it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;
        let mut layered = Layered::from_file(file);
        layered.apply_env()?;
        layered.build()
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
