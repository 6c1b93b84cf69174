use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Everything read from the environment, collected once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Host the LNURL callback is served from, without scheme.
    pub domain: String,
    pub mempool_api_url: String,
    pub database_url: Option<String>,
    pub cors_origins: Vec<String>,
    pub store_verification_amount: u64,
    pub review_min_amount: u64,
    pub explorer_timeout: Duration,
    pub monitor_interval: Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let domain = var("DOMAIN").unwrap_or_else(|| "localhost".into());
        let domain = domain
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();

        let cors_origins = var("CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: parse(&var, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            domain,
            mempool_api_url: var("MEMPOOL_API_URL")
                .unwrap_or_else(|| "https://mempool.space/api".into()),
            database_url: var("DATABASE_URL"),
            cors_origins,
            store_verification_amount: parse(&var, "STORE_VERIFICATION_AMOUNT", 5000)?,
            review_min_amount: parse(&var, "REVIEW_MIN_AMOUNT", 1)?,
            explorer_timeout: Duration::from_millis(nonzero(&var, "EXPLORER_TIMEOUT_MS", 10_000)?),
            monitor_interval: Duration::from_secs(nonzero(&var, "MONITOR_INTERVAL_SECS", 30)?),
            request_timeout: Duration::from_secs(nonzero(&var, "REQUEST_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Durations: zero would stall timers or time out every request.
fn nonzero(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parse(var, key, default)? {
        0 => Err(ConfigError::InvalidValue { key, value: "0".into() }),
        n => Ok(n),
    }
}
