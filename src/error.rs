use std::time::Duration;

use thiserror::Error;

/// Configuration could not be read from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} missing, it is required")]
    Missing(&'static str),

    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// The persistence collaborator failed to return the active flag set.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed flag row {name:?}: {reason}")]
    MalformedRow { name: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The change-notification subscription failed or ended.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to subscribe to change feed: {0}")]
    Subscribe(String),

    #[error("change feed connection lost: {0}")]
    ConnectionLost(String),

    #[error("change feed closed by the store")]
    Closed,
}

impl From<sqlx::Error> for FeedError {
    fn from(err: sqlx::Error) -> Self {
        FeedError::ConnectionLost(err.to_string())
    }
}

/// A refresh did not produce a new snapshot. The previous one is still active.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("loading flags failed: {0}")]
    Load(#[from] LoadError),

    #[error("loading flags timed out after {0:?}")]
    Timeout(Duration),
}

/// Evaluation was requested before the first successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flag cache is not ready yet")]
pub struct CacheNotReady;
