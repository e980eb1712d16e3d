//! Database configuration.
//!
//! Loaded from `DATABASE_*` environment variables with defaults. The
//! password only ever leaves this module inside [`DatabaseConfig::dsn`];
//! logs get [`DatabaseConfig::redacted_dsn`].

use querybus_core::StartupError;
use querybus_runtime::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    /// MySQL or `MariaDB`
    #[default]
    MySql,
    /// `PostgreSQL`
    Postgres,
}

impl Driver {
    /// URL scheme understood by sqlx.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Port used when none is configured.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Driver {
    type Err = StartupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(StartupError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// Connection settings for [`SqlxConnectionProvider`](crate::SqlxConnectionProvider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Which store to talk to.
    pub driver: Driver,
    /// Database (schema) name.
    pub database: String,
    /// Login user.
    pub user: String,
    /// Login password.
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Upper bound on pooled connections.
    pub max_open_connections: u32,
    /// Connections the pool keeps open while idle.
    pub max_idle_connections: u32,
    /// How long a statement may wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Rows a read may buffer ahead of its consumer.
    pub row_buffer: usize,
    /// Backoff for establishing the first connection.
    #[serde(skip)]
    pub connect_retry: RetryPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: Driver::MySql,
            database: "shop".to_string(),
            user: "root".to_string(),
            password: String::new(),
            host: "127.0.0.1".to_string(),
            port: Driver::MySql.default_port(),
            max_open_connections: 10,
            max_idle_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            row_buffer: 64,
            connect_retry: RetryPolicy::default(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from `DATABASE_*` environment variables.
    ///
    /// `DATABASE_PORT` defaults to the driver's standard port.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::UnsupportedDriver`] for an unknown
    /// `DATABASE_DRIVER`, or [`StartupError::InvalidConfig`] if the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, StartupError> {
        let defaults = Self::default();
        let driver = match env::var("DATABASE_DRIVER") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.driver,
        };

        let config = Self {
            driver,
            database: env::var("DATABASE_NAME").unwrap_or(defaults.database),
            user: env::var("DATABASE_USER").unwrap_or(defaults.user),
            password: env::var("DATABASE_PASSWORD").unwrap_or(defaults.password),
            host: env::var("DATABASE_HOST").unwrap_or(defaults.host),
            port: parse_var("DATABASE_PORT").unwrap_or_else(|| driver.default_port()),
            max_open_connections: parse_var("DATABASE_MAX_OPEN_CONNECTIONS")
                .unwrap_or(defaults.max_open_connections),
            max_idle_connections: parse_var("DATABASE_MAX_IDLE_CONNECTIONS")
                .unwrap_or(defaults.max_idle_connections),
            acquire_timeout: parse_var("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .map_or(defaults.acquire_timeout, Duration::from_secs),
            row_buffer: parse_var("DATABASE_ROW_BUFFER").unwrap_or(defaults.row_buffer),
            connect_retry: defaults.connect_retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check limits before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::InvalidConfig`] if there are no connections to
    /// open, more idle than open connections, or an empty host or database.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.max_open_connections == 0 {
            return Err(StartupError::InvalidConfig(
                "max_open_connections must be at least 1".to_string(),
            ));
        }
        if self.max_idle_connections > self.max_open_connections {
            return Err(StartupError::InvalidConfig(format!(
                "max_idle_connections ({}) exceeds max_open_connections ({})",
                self.max_idle_connections, self.max_open_connections
            )));
        }
        if self.host.trim().is_empty() || self.database.trim().is_empty() {
            return Err(StartupError::InvalidConfig(
                "host and database must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection URL including credentials.
    #[must_use]
    pub fn dsn(&self) -> String {
        self.url(&encode_userinfo(&self.password))
    }

    /// Connection URL with the password masked, for logs.
    #[must_use]
    pub fn redacted_dsn(&self) -> String {
        if self.password.is_empty() {
            self.url("")
        } else {
            self.url("***")
        }
    }

    fn url(&self, password: &str) -> String {
        let credentials = if password.is_empty() {
            encode_userinfo(&self.user)
        } else {
            format!("{}:{password}", encode_userinfo(&self.user))
        };
        format!(
            "{}://{credentials}@{}:{}/{}",
            self.driver.scheme(),
            self.host,
            self.port,
            self.database
        )
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_userinfo(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
