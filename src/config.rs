use std::{env, fmt::Display, net::SocketAddr, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

use crate::registry::{QuotaPolicy, DEFAULT_USAGE_LIMIT, REFRESH_INTERVAL_SECONDS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub store: StoreBackend,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    pub sqlite_path: String,
    pub refresh_interval_seconds: u64,
    pub default_usage_limit: u64,
}

impl Config {
    /// Read `.env` (if present) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; missing keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            addr: try_load(&lookup, "GATEWAY_ADDR", "127.0.0.1:3000")?,
            store: try_load(&lookup, "QUOTA_STORE", "redis")?,
            redis_host: try_load(&lookup, "REDIS_HOST", "localhost")?,
            redis_port: try_load(&lookup, "REDIS_PORT", "6379")?,
            redis_db: try_load(&lookup, "REDIS_DB", "0")?,
            sqlite_path: try_load(&lookup, "SQLITE_PATH", "db/quota.db")?,
            refresh_interval_seconds: try_load(
                &lookup,
                "REFRESH_INTERVAL_SECONDS",
                &REFRESH_INTERVAL_SECONDS.to_string(),
            )?,
            default_usage_limit: try_load(
                &lookup,
                "DEFAULT_USAGE_LIMIT",
                &DEFAULT_USAGE_LIMIT.to_string(),
            )?,
        })
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            refresh_interval_seconds: self.refresh_interval_seconds,
            default_usage_limit: self.default_usage_limit,
        }
    }
}

fn try_load<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }
    })
}
