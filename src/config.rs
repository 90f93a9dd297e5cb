//! Tracker configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

pub const ENV_STORE_HOST: &str = "SESSION_STORE_HOST";
pub const ENV_STORE_PORT: &str = "SESSION_STORE_PORT";
pub const ENV_STORE_DB: &str = "SESSION_STORE_DB";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "SESSION_STORE_CONNECT_TIMEOUT_MS";
pub const ENV_IO_TIMEOUT_MS: &str = "SESSION_STORE_IO_TIMEOUT_MS";
pub const ENV_DEFAULT_TTL: &str = "SESSION_DEFAULT_TTL";
pub const ENV_MAX_TTL: &str = "SESSION_MAX_TTL";
pub const ENV_TTL_GRACE: &str = "SESSION_TTL_GRACE";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 2000;

/// TTL for sessions whose NAS does not announce an interim interval.
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// Absolute ceiling on any session TTL.
const DEFAULT_MAX_TTL_SECS: u64 = 86_400;

/// Slack added on top of two missed interim intervals.
const DEFAULT_TTL_GRACE_SECS: u64 = 60;

/// Where and how to reach the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    /// Logical database selected on every fresh connection.
    pub db: u32,
    pub connect_timeout: Duration,
    /// Bound on each write and each reply read.
    pub io_timeout: Duration,
}

impl StoreConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db: 0,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

/// Session record expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default_ttl: u64,
    pub max_ttl: u64,
    pub grace: u64,
}

impl TtlPolicy {
    /// TTL for a session announcing `interim_interval` seconds between updates.
    ///
    /// A record survives two missed interim updates plus the grace period,
    /// capped at `max_ttl`. Without an interval the default TTL applies.
    /// Never returns zero, since a zero expiry deletes the key outright.
    pub fn session_ttl(&self, interim_interval: u32) -> u64 {
        let ttl = if interim_interval > 0 {
            (u64::from(interim_interval) * 2)
                .saturating_add(self.grace)
                .min(self.max_ttl)
        } else {
            self.default_ttl
        };
        ttl.max(1)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_SESSION_TTL_SECS,
            max_ttl: DEFAULT_MAX_TTL_SECS,
            grace: DEFAULT_TTL_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerConfig {
    pub store: StoreConfig,
    pub ttl: TtlPolicy,
}

impl TrackerConfig {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// missing or unparseable values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let host = lookup(ENV_STORE_HOST)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.store.host);

        Self {
            store: StoreConfig {
                host,
                port: parse_or(&lookup, ENV_STORE_PORT, defaults.store.port),
                db: parse_or(&lookup, ENV_STORE_DB, defaults.store.db),
                connect_timeout: Duration::from_millis(parse_or(
                    &lookup,
                    ENV_CONNECT_TIMEOUT_MS,
                    DEFAULT_CONNECT_TIMEOUT_MS,
                )),
                io_timeout: Duration::from_millis(parse_or(
                    &lookup,
                    ENV_IO_TIMEOUT_MS,
                    DEFAULT_IO_TIMEOUT_MS,
                )),
            },
            ttl: TtlPolicy {
                default_ttl: parse_or(&lookup, ENV_DEFAULT_TTL, defaults.ttl.default_ttl),
                max_ttl: parse_or(&lookup, ENV_MAX_TTL, defaults.ttl.max_ttl),
                grace: parse_or(&lookup, ENV_TTL_GRACE, defaults.ttl.grace),
            },
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = ?default, "ignoring invalid configuration value");
                default
            }
        },
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
