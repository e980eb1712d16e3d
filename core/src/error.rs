//! Error taxonomy for the query bus.
//!
//! Three layers, from the store outwards:
//!
//! - [`ExecutionError`]: the store (or the provider in front of it) failed
//!   to run a statement. Carried inside a result on the reply conduit.
//! - [`BusError`]: what a caller sees from a submission. Either the bus
//!   could not complete the round trip in time, or it wraps an
//!   [`ExecutionError`].
//! - [`StartupError`]: the bus or its provider could not be brought up.
//!   Fatal; returned before any traffic is accepted.
//!
//! Nothing here is retried or rolled back by the bus. Compensating a
//! multi-statement sequence is the caller's job.

use crate::envelope::RequestClass;
use thiserror::Error;

/// The store rejected or could not run a statement.
///
/// A single statement that fails with one of these did not partially apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The store rejected the statement (constraint violation, malformed
    /// SQL, permission denied).
    #[error("Statement rejected{}: {message}", code_suffix(.code))]
    Rejected {
        /// Driver-specific error code, when the driver reports one.
        code: Option<String>,
        /// Human-readable message from the store.
        message: String,
    },

    /// Connectivity or pool failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A row or column could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The provider panicked while running the statement.
    ///
    /// The worker survives and moves on to the next envelope.
    #[error("Provider panicked: {0}")]
    Panicked(String),

    /// Any other provider failure.
    #[error("Execution failed: {0}")]
    Other(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl ExecutionError {
    /// Shorthand for a [`ExecutionError::Rejected`] with a code.
    #[must_use]
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Whether the failure came from the connection rather than the statement.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Errors returned to a caller of the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The queue stayed full for the whole budget. The request never ran
    /// and is safe to retry.
    #[error("Timed out enqueueing {class} request")]
    EnqueueTimeout {
        /// Class of the abandoned request.
        class: RequestClass,
    },

    /// The request was enqueued but no reply arrived within the budget.
    ///
    /// It may still run to completion. Retrying a mutation blindly can
    /// apply it twice.
    #[error("Timed out waiting for {class} reply")]
    ReplyTimeout {
        /// Class of the request whose outcome is unknown.
        class: RequestClass,
    },

    /// The store failed to run the request.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The bus is shutting down and no longer accepts requests.
    #[error("Query bus is closed")]
    Closed,

    /// The reply conduit was dropped without a result.
    ///
    /// Only happens when workers are aborted by a forced shutdown.
    #[error("Worker dropped the reply without a result")]
    WorkerLost,

    /// Shutdown gave up waiting for workers to drain.
    #[error("Shutdown timed out with {0} workers still running")]
    ShutdownTimeout(usize),
}

impl BusError {
    /// Whether retrying is known to be safe: the request never ran.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::EnqueueTimeout { .. })
    }

    /// Whether the caller knows if the request took effect.
    #[must_use]
    pub const fn outcome_known(&self) -> bool {
        !matches!(self, Self::ReplyTimeout { .. } | Self::WorkerLost)
    }

    /// Whether this is one of the two timeout outcomes.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::EnqueueTimeout { .. } | Self::ReplyTimeout { .. }
        )
    }
}

/// The bus or its connection provider could not start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured database driver is not supported.
    #[error("Unsupported database driver: {0}")]
    UnsupportedDriver(String),

    /// The initial connection could not be established.
    #[error("Failed to connect: {0}")]
    Connect(String),
}
