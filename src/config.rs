//! Ledger configuration.
//!
//! Loaded once at startup from the environment (a `.env` file is honoured if
//! present). Every key is optional; missing keys fall back to the defaults in
//! [`LedgerConfig::default`].
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset (memory adapter) |
//! | `LEDGER_MAX_CONNECTIONS` | `10` |
//! | `LEDGER_ACQUIRE_TIMEOUT_MS` | `3000` |
//! | `LEDGER_LOCK_TIMEOUT_MS` | `5000` |
//! | `LEDGER_ACCOUNT_NUMBER_PREFIX` | `ACC` |
//! | `LEDGER_ACCOUNT_NUMBER_ATTEMPTS` | `10` |
//! | `LEDGER_HISTORY_PAGE_SIZE` | `50` |
//! | `LEDGER_DEFAULT_CURRENCY` | `ZAR` |
//! | `LEDGER_LOG_LEVEL` | `info` |
//! | `LEDGER_LOG_FORMAT` | `json` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::money::Currency;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "compact" => Ok(Self::Text),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Postgres connection string. `None` means run on the memory adapter.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// How long to wait for a pooled connection before reporting the store unavailable.
    pub acquire_timeout: Duration,
    /// Upper bound on acquiring account locks for one operation.
    pub lock_timeout: Duration,
    pub account_number_prefix: String,
    pub account_number_attempts: u32,
    pub history_page_size: usize,
    pub default_currency: Currency,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_millis(3_000),
            lock_timeout: Duration::from_millis(5_000),
            account_number_prefix: "ACC".to_string(),
            account_number_attempts: 10,
            history_page_size: 50,
            default_currency: Currency::from_static("ZAR"),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            parsed(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let default_currency = match lookup("LEDGER_DEFAULT_CURRENCY") {
            Some(code) => Currency::new(&code).map_err(|e| invalid("LEDGER_DEFAULT_CURRENCY", e))?,
            None => defaults.default_currency,
        };

        let history_page_size = parsed(&lookup, "LEDGER_HISTORY_PAGE_SIZE", defaults.history_page_size)?;
        if history_page_size == 0 {
            return Err(invalid("LEDGER_HISTORY_PAGE_SIZE", "must be at least 1"));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parsed(&lookup, "LEDGER_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: millis("LEDGER_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout)?,
            lock_timeout: millis("LEDGER_LOCK_TIMEOUT_MS", defaults.lock_timeout)?,
            account_number_prefix: lookup("LEDGER_ACCOUNT_NUMBER_PREFIX")
                .unwrap_or(defaults.account_number_prefix),
            account_number_attempts: parsed(
                &lookup,
                "LEDGER_ACCOUNT_NUMBER_ATTEMPTS",
                defaults.account_number_attempts,
            )?,
            history_page_size,
            default_currency,
            log_level: lookup("LEDGER_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parsed(&lookup, "LEDGER_LOG_FORMAT", defaults.log_format)?,
        })
    }
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e)),
        None => Ok(default),
    }
}
