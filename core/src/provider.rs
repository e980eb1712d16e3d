//! Connection provider abstraction.
//!
//! The provider owns the physical connection(s) to the relational store and
//! is the only shared mutable resource behind the bus. Callers never touch
//! it directly: only workers do.
//!
//! # Implementations
//!
//! - `SqlxConnectionProvider` (in `querybus-sqlx`): MySQL / `PostgreSQL` via sqlx
//! - `InMemoryConnectionProvider` (in `querybus-testing`): scripted, deterministic
//!
//! # Concurrency
//!
//! Providers are invoked concurrently by every worker. One that holds a
//! single physical connection must serialize internally.
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` values rather than using
//! `async fn`, so the returned futures are guaranteed `Send` and the trait
//! can be used as `Arc<dyn ConnectionProvider<Row = R>>`.

use crate::envelope::{MutationResult, ReadResult};
use crate::value::BindValue;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs statements against the backing store.
///
/// Failures on individual statements are returned as
/// [`ExecutionError`](crate::ExecutionError) values inside the result; a
/// provider must never bring the process down over a bad query.
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Row type yielded by read queries.
    type Row: Send + 'static;

    /// Provider name for logs and health reports.
    fn name(&self) -> &str;

    /// Run a read query and return a lazy cursor over its rows.
    ///
    /// A statement that fails up front must be reported as an error here,
    /// not as an error on the cursor's first row.
    fn query<'a>(&'a self, sql: &'a str, args: &'a [BindValue])
    -> ProviderFuture<'a, ReadResult<Self::Row>>;

    /// Run a parameterized mutation.
    fn execute<'a>(&'a self, sql: &'a str, args: &'a [BindValue])
    -> ProviderFuture<'a, MutationResult>;
}
