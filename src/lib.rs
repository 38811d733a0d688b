mod connection;
pub mod cache;
pub mod config;
pub mod error;
pub mod guard;
pub mod pool;
pub mod state;

use async_trait::async_trait;

/// Manager opens raw connections and checks them for the pool
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    type Error: std::fmt::Display + Send;

    /// open a new raw connection to `target`
    async fn connect(&self, target: &ConnectTarget) -> Result<Self::Connection, Self::Error>;

    /// cheap local check, no round trip
    fn is_closed(&self, conn: &Self::Connection) -> bool;

    /// run `query` against the backend, any error marks the connection bad
    async fn probe(&self, conn: &mut Self::Connection, query: &str) -> Result<(), Self::Error>;

    /// false when the connection may carry uncommitted work
    fn auto_commit(&self, _conn: &Self::Connection) -> bool {
        true
    }

    async fn rollback(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    /// physically close; the connection is dropped right after
    async fn close(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Everything a [`Manager`] needs to open one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub endpoint: String,
    pub principal: String,
    pub credential: String,
    /// `driver.*` properties, prefix stripped
    pub properties: std::collections::BTreeMap<String, String>,
}

pub use cache::{BlockingCache, Cache, KeyLock, Lookup, PerpetualCache};
pub use config::PoolConfig;
pub use error::{CacheError, ConfigError, PoolError};
pub use guard::{ConnectionRef, PooledConnection};
pub use pool::Pool;
pub use state::State;
