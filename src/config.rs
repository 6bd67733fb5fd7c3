use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::ConfigError;
use crate::flags::Environment;
use crate::store::postgres::DEFAULT_NOTIFY_CHANNEL;
use crate::subscriber::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Only cache flags for this environment. All environments when unset.
    pub environment: Option<Environment>,
    pub notify_channel: String,
    pub refresh_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// How long boot waits for the first load before serving anyway.
    pub startup_wait: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = parse::<u16>(&lookup, "PORT", "a valid u16 number")?.ok_or(ConfigError::Missing("PORT"))?;
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let environment = match lookup("FLAG_ENVIRONMENT") {
            Some(value) => Some(value.parse::<Environment>().map_err(|_| ConfigError::Invalid {
                name: "FLAG_ENVIRONMENT",
                expected: "one of dev, staging, prod",
                value,
            })?),
            None => None,
        };

        let backoff_base = seconds(&lookup, "BACKOFF_BASE_SECS", 5)?;
        let backoff_max = seconds(&lookup, "BACKOFF_MAX_SECS", backoff_base.as_secs())?;
        let backoff = if backoff_max > backoff_base {
            BackoffPolicy::exponential(backoff_base, backoff_max)
        } else {
            BackoffPolicy::fixed(backoff_base)
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            database_url,
            environment,
            notify_channel: lookup("FLAG_NOTIFY_CHANNEL").unwrap_or_else(|| DEFAULT_NOTIFY_CHANNEL.to_string()),
            refresh_timeout: seconds(&lookup, "REFRESH_TIMEOUT_SECS", 10)?,
            backoff,
            startup_wait: seconds(&lookup, "STARTUP_WAIT_SECS", 15)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, expected, value }),
        None => Ok(None),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = parse::<u64>(lookup, name, "a whole number of seconds")?.unwrap_or(default);
    Ok(Duration::from_secs(secs))
}
