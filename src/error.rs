//! Error kinds surfaced by the pool, the cache decorator and configuration.

use std::time::Duration;
use thiserror::Error;

/// Errors returned while checking out or using a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Too many bad connections in a row for one checkout attempt.
    #[error("could not get a good connection to the database after {attempts} bad connections")]
    Exhausted { attempts: usize },

    /// The wait was cancelled, or the pool ended up without a handle.
    #[error("connection pool unavailable: {0}")]
    Unavailable(String),

    /// The manager failed to open a new connection.
    #[error("failed to open connection: {0}")]
    Connect(String),

    /// The handle was returned, reclaimed as overdue, or force-closed.
    #[error("connection handle is no longer valid")]
    Invalidated,
}

/// Errors returned by [`BlockingCache`](crate::BlockingCache) lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("couldn't get a lock in {timeout:?} for the key {key} at the cache {cache}")]
    LockTimeout {
        key: String,
        cache: String,
        timeout: Duration,
    },

    #[error("got interrupted while trying to acquire lock for key {key}")]
    Interrupted { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown pool property: {0}")]
    UnknownProperty(String),

    #[error("invalid value {value:?} for pool property {key}")]
    InvalidValue { key: String, value: String },

    #[error("invalid pool configuration: {0}")]
    Invalid(&'static str),
}
