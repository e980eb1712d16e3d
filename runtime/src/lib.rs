//! # Querybus Runtime
//!
//! The executor side of the query bus: a fixed set of long-lived workers
//! that take envelopes from bounded queues, run them against a
//! [`ConnectionProvider`](querybus_core::ConnectionProvider) and answer on
//! each envelope's reply conduit.
//!
//! ## Components
//!
//! - **Worker pools**: one for reads, one for mutations, never mixed
//! - **Shard lanes**: single-worker queues that keep per-key mutation order
//! - **Round trip**: the two-phase enqueue/reply wait under a time budget
//! - **Shutdown**: stop signal, drain of queued work, forced abort on timeout
//!
//! ## Example
//!
//! ```
//! use querybus_runtime::{BusConfig, QueryBus, RequestBudget};
//! use querybus_testing::{InMemoryConnectionProvider, insert_into};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = InMemoryConnectionProvider::new();
//! provider.on_execute("INSERT INTO cart (user_id, product_id) VALUES (?, ?)", insert_into("cart"));
//! provider.on_query("SELECT user_id, product_id FROM cart WHERE user_id = ?", |tables, args| {
//!     Ok(tables.select_where("cart", 0, &args[0]))
//! });
//!
//! let bus = QueryBus::start(provider, BusConfig::default())?;
//!
//! // One budget for the whole handler.
//! let budget = RequestBudget::shared(Duration::from_secs(2));
//! bus.submit_sharded_mutation(
//!     "user-42",
//!     "INSERT INTO cart (user_id, product_id) VALUES (?, ?)",
//!     vec!["user-42".into(), 55_i64.into()],
//!     budget,
//! )
//! .await?;
//! let rows = bus
//!     .submit_read_with_args(
//!         "SELECT user_id, product_id FROM cart WHERE user_id = ?",
//!         vec!["user-42".into()],
//!         budget,
//!     )
//!     .await?
//!     .collect_rows()
//!     .await?;
//! assert_eq!(rows.len(), 1);
//!
//! bus.shutdown_with_default().await?;
//! # Ok(())
//! # }
//! ```

/// Bus configuration
pub mod config;

/// Request budgets and the enqueue/reply round trip
pub mod deadline;

/// Worker pools over bounded queues
mod pool;

/// Shard key routing
pub mod shard;

/// The query bus handle
pub mod bus;

/// Health reporting
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

pub use bus::{BusStats, QueryBus};
pub use config::{BusConfig, TimeoutPolicy};
pub use deadline::RequestBudget;
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use pool::QueueStats;
pub use querybus_core::{BusError, ExecutionError, StartupError};
pub use shard::ShardRouter;
