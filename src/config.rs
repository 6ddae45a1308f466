//! Configuration: built-in defaults, then an optional TOML file, then
//! `CANONRY_`-prefixed environment variables.
//!
//! Nested keys are split on `__`, so `CANONRY_RATE_LIMIT__QUOTA=30` sets
//! `rate_limit.quota`. A bare `DATABASE_URL` is also honored.

use crate::catalog::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "canonry.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Level for this crate's own events; other crates log at `warn`.
    pub log_level: String,
    /// PostgreSQL connection string. Without one, results live in memory.
    pub database_url: Option<String>,
    pub catalog: CatalogConfig,
    pub rate_limit: RateLimitConfig,
    pub workers: usize,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database_url: None,
            catalog: CatalogConfig::default(),
            rate_limit: RateLimitConfig::default(),
            workers: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    /// Upper bound on one search call.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Catalog calls allowed in any rolling `window`.
    pub quota: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
        }
    }
}

impl Config {
    /// Provider chain for `path`, or `canonry.toml` in the working directory.
    /// A missing file contributes nothing.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        Figment::new()
            .merge(Toml::file(file))
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed("CANONRY_").split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            quota: self.rate_limit.quota,
            window: self.rate_limit.window,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: self.retry.base_delay,
                max_delay: self.retry.max_delay,
            },
            call_timeout: self.catalog.timeout,
        }
    }
}

/// Accepts a human duration string (`"500ms"`, `"10s"`, `"2m"`) or a bare
/// integer number of seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration like \"10s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            fundu::parse_duration(value.trim())
                .map_err(|e| E::custom(format!("invalid duration {value:?}: {e}")))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("duration must not be negative, got {value}")))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
