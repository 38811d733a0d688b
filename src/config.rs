use crate::error::ConfigError;
use crate::ConnectTarget;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

const DRIVER_PREFIX: &str = "driver.";

/// Pool sizing, credentials and liveness settings.
///
/// Every change through [`Pool::reconfigure`](crate::Pool::reconfigure)
/// force-closes all connections, so treat a config as immutable while the
/// pool is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub endpoint: String,
    pub principal: String,
    pub credential: String,
    /// Free-form properties handed to the manager on connect
    pub properties: BTreeMap<String, String>,
    /// Connections that may be checked out at the same time
    pub max_active: usize,
    /// Connections kept open while unused
    pub max_idle: usize,
    /// Checkout age after which a connection may be reclaimed by a waiter
    pub max_checkout_time: Duration,
    /// Upper bound for a single wait before the pool state is re-checked
    pub time_to_wait: Duration,
    /// Extra bad connections a single checkout tolerates on top of `max_idle`
    pub max_local_bad_connection_tolerance: usize,
    pub ping_enabled: bool,
    pub ping_query: String,
    /// Connections used more recently than this are not pinged
    pub ping_connections_not_used_for: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            principal: String::new(),
            credential: String::new(),
            properties: BTreeMap::new(),
            max_active: 10,
            max_idle: 5,
            max_checkout_time: Duration::from_millis(20_000),
            time_to_wait: Duration::from_millis(20_000),
            max_local_bad_connection_tolerance: 3,
            ping_enabled: false,
            ping_query: "NO PING QUERY SET".to_string(),
            ping_connections_not_used_for: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    pub fn new(
        endpoint: impl Into<String>,
        principal: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            principal: principal.into(),
            credential: credential.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_active(mut self, n: usize) -> Self {
        self.max_active = n;
        self
    }

    #[must_use]
    pub fn with_max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    #[must_use]
    pub fn with_max_checkout_time(mut self, d: Duration) -> Self {
        self.max_checkout_time = d;
        self
    }

    #[must_use]
    pub fn with_time_to_wait(mut self, d: Duration) -> Self {
        self.time_to_wait = d;
        self
    }

    #[must_use]
    pub fn with_bad_connection_tolerance(mut self, n: usize) -> Self {
        self.max_local_bad_connection_tolerance = n;
        self
    }

    /// Enable pinging with `query` for connections idle longer than `not_used_for`.
    #[must_use]
    pub fn with_ping(mut self, query: impl Into<String>, not_used_for: Duration) -> Self {
        self.ping_enabled = true;
        self.ping_query = query.into();
        self.ping_connections_not_used_for = not_used_for;
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active == 0 {
            return Err(ConfigError::Invalid("max_active must be at least 1"));
        }
        if self.time_to_wait.is_zero() {
            return Err(ConfigError::Invalid("time_to_wait must be greater than zero"));
        }
        Ok(())
    }

    /// Build a config from datasource-style string properties.
    ///
    /// Durations are milliseconds. Keys prefixed with `driver.` are passed
    /// through to the manager with the prefix stripped.
    pub fn from_properties<I, K, V>(props: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in props {
            let (key, value) = (key.as_ref(), value.as_ref());
            if let Some(name) = key.strip_prefix(DRIVER_PREFIX) {
                config.properties.insert(name.to_string(), value.to_string());
                continue;
            }
            match key {
                "url" => config.endpoint = value.to_string(),
                "username" => config.principal = value.to_string(),
                "password" => config.credential = value.to_string(),
                "poolMaximumActiveConnections" => config.max_active = parse(key, value)?,
                "poolMaximumIdleConnections" => config.max_idle = parse(key, value)?,
                "poolMaximumCheckoutTime" => config.max_checkout_time = parse_millis(key, value)?,
                "poolTimeToWait" => config.time_to_wait = parse_millis(key, value)?,
                "poolMaximumLocalBadConnectionTolerance" => {
                    config.max_local_bad_connection_tolerance = parse(key, value)?
                }
                "poolPingEnabled" => config.ping_enabled = parse(key, value)?,
                "poolPingQuery" => config.ping_query = value.to_string(),
                "poolPingConnectionsNotUsedFor" => {
                    config.ping_connections_not_used_for = parse_millis(key, value)?
                }
                _ => return Err(ConfigError::UnknownProperty(key.to_string())),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn target_for(&self, principal: &str, credential: &str) -> ConnectTarget {
        ConnectTarget {
            endpoint: self.endpoint.clone(),
            principal: principal.to_string(),
            credential: credential.to_string(),
            properties: self.properties.clone(),
        }
    }

    /// Type code of connections opened with the configured credentials.
    pub fn expected_type_code(&self) -> u64 {
        type_code(&self.endpoint, &self.principal, &self.credential)
    }
}

/// Fingerprint of the endpoint and credentials a connection was opened with.
pub fn type_code(endpoint: &str, principal: &str, credential: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    principal.hash(&mut hasher);
    credential.hash(&mut hasher);
    hasher.finish()
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
