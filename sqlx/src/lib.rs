//! sqlx connection provider for the query bus.
//!
//! Backs the bus with a pooled connection to MySQL or `PostgreSQL` through
//! sqlx's `Any` driver. The driver is chosen at runtime from configuration,
//! so one binary can serve either store.
//!
//! - Database configuration from `DATABASE_*` environment variables
//! - Connection pool sized by the open and idle connection limits
//! - Startup connect verified with `SELECT 1`, retried with backoff
//! - Read results streamed row by row into a [`RowCursor`](querybus_core::RowCursor)
//!
//! # Example
//!
//! ```no_run
//! use querybus_runtime::{BusConfig, QueryBus};
//! use querybus_sqlx::{DatabaseConfig, SqlxConnectionProvider};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DatabaseConfig::from_env()?;
//! let provider = SqlxConnectionProvider::connect(&config).await?;
//! let bus = QueryBus::start(
//!     provider,
//!     BusConfig::default().with_pool_size(config.max_open_connections as usize),
//! )?;
//!
//! let exists = bus
//!     .submit_read_with_args(
//!         "SELECT id FROM users WHERE email = ?",
//!         vec!["kim@example.com".into()],
//!         Duration::from_secs(2),
//!     )
//!     .await?
//!     .first()
//!     .await?
//!     .is_some();
//! # let _ = exists;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Database configuration and DSN building
pub mod config;

/// The sqlx-backed connection provider
pub mod provider;

pub use config::{DatabaseConfig, Driver};
pub use provider::{SqlxConnectionProvider, decode_row, map_sqlx_error};
