//! # Querybus Core
//!
//! Core types for the asynchronous database command bus.
//!
//! This crate defines the vocabulary shared by callers, workers and
//! connection providers. It performs no I/O and owns no tasks; the executor
//! lives in `querybus-runtime` and the production provider in `querybus-sqlx`.
//!
//! ## Core Concepts
//!
//! - **Envelope**: [`ReadRequest`] or [`MutationRequest`], carrying query text,
//!   positional [`BindValue`] arguments and a single-use [`Reply`] conduit
//! - **Reply conduit**: one-shot hand-off from the worker back to the caller
//! - **Row cursor**: lazy, forward-only sequence of rows ([`RowCursor`])
//! - **Connection provider**: the store behind the bus ([`ConnectionProvider`])
//!
//! ## Example
//!
//! ```
//! use querybus_core::envelope::{MutationRequest, MutationResult};
//! use querybus_core::reply::reply_channel;
//! use querybus_core::value::BindValue;
//!
//! let (reply, _receiver) = reply_channel::<MutationResult>();
//! let request = MutationRequest::new(
//!     "INSERT INTO emails (email) VALUES (?)",
//!     vec![BindValue::from("kim@example.com")],
//!     reply,
//! );
//! assert_eq!(request.args().len(), 1);
//! ```

/// Positional bind values
pub mod value;

/// Single-use reply conduit between a worker and a caller
pub mod reply;

/// Lazy, forward-only row cursor
pub mod cursor;

/// Request envelopes and their results
pub mod envelope;

/// Connection provider abstraction
pub mod provider;

/// Error taxonomy for the bus
pub mod error;

pub use cursor::{RowCursor, RowSink};
pub use envelope::{
    ExecutionSummary, MutationRequest, MutationResult, ReadRequest, ReadResult, RequestClass,
};
pub use error::{BusError, ExecutionError, StartupError};
pub use provider::{ConnectionProvider, ProviderFuture};
pub use reply::{Reply, ReplyReceiver, reply_channel};
pub use value::BindValue;
