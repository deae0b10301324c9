//! Process configuration, read once from `BOOKIT_*` environment variables.
//! Unset or unparseable values fall back to their defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::store::RetryPolicy;

/// Knobs the booking engine itself needs, independent of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub store_timeout: Duration,
    pub read_retries: u32,
    pub retry_backoff: Duration,
    pub token_cache_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            store_timeout: policy.timeout,
            read_retries: policy.read_retries,
            retry_backoff: policy.backoff,
            token_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.store_timeout,
            read_retries: self.read_retries,
            backoff: self.retry_backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    /// Issued on start when the store holds no api token yet.
    pub bootstrap_api_token: Option<String>,
    pub engine: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup as &dyn Fn(&str) -> Option<String>;
        let engine_defaults = EngineSettings::default();
        Self {
            bind: lookup("BOOKIT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(lookup, "BOOKIT_PORT").unwrap_or(7411),
            data_dir: lookup("BOOKIT_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            max_connections: parsed(lookup, "BOOKIT_MAX_CONNECTIONS").unwrap_or(256),
            metrics_port: parsed(lookup, "BOOKIT_METRICS_PORT"),
            compact_threshold: parsed(lookup, "BOOKIT_COMPACT_THRESHOLD").unwrap_or(1000),
            reaper_interval: millis(lookup, "BOOKIT_REAPER_INTERVAL_MS", Duration::from_secs(5)),
            bootstrap_api_token: lookup("BOOKIT_API_TOKEN").filter(|t| !t.is_empty()),
            engine: EngineSettings {
                store_timeout: millis(
                    lookup,
                    "BOOKIT_STORE_TIMEOUT_MS",
                    engine_defaults.store_timeout,
                ),
                read_retries: parsed(lookup, "BOOKIT_STORE_READ_RETRIES")
                    .unwrap_or(engine_defaults.read_retries),
                retry_backoff: millis(
                    lookup,
                    "BOOKIT_STORE_RETRY_BACKOFF_MS",
                    engine_defaults.retry_backoff,
                ),
                token_cache_ttl: millis(
                    lookup,
                    "BOOKIT_TOKEN_CACHE_MS",
                    engine_defaults.token_cache_ttl,
                ),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookit.wal")
    }
}

fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn millis(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    parsed(lookup, key).map(Duration::from_millis).unwrap_or(default)
}
