//! Request envelopes and their results.
//!
//! An envelope is created by a caller, enters exactly one queue, is consumed
//! by exactly one worker and is discarded once its reply has been written.
//! Envelopes are immutable after construction: fields are private and the
//! only way to take them apart is [`ReadRequest::into_parts`] /
//! [`MutationRequest::into_parts`], which consumes the envelope.

use crate::cursor::RowCursor;
use crate::error::ExecutionError;
use crate::reply::Reply;
use crate::value::BindValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a read request: a cursor over the rows, or the store's error.
pub type ReadResult<R> = Result<RowCursor<R>, ExecutionError>;

/// Result of a mutation request: what the store reported, or its error.
pub type MutationResult = Result<ExecutionSummary, ExecutionError>;

/// What a mutation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Generated id, for drivers that report one.
    pub last_insert_id: Option<i64>,
}

impl ExecutionSummary {
    /// Summary for a statement that touched `rows_affected` rows.
    #[must_use]
    pub const fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }

    /// Attach a generated id.
    #[must_use]
    pub const fn with_last_insert_id(mut self, id: i64) -> Self {
        self.last_insert_id = Some(id);
        self
    }
}

/// Which path a request travels through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Read on the shared read pool.
    Read,
    /// Mutation on the shared mutation pool.
    Mutation,
    /// Mutation pinned to a shard lane.
    Sharded,
}

impl RequestClass {
    /// Label used for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Mutation => "mutation",
            Self::Sharded => "sharded",
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read query on its way to a worker.
pub struct ReadRequest<R> {
    sql: String,
    args: Vec<BindValue>,
    reply: Reply<ReadResult<R>>,
}

impl<R> ReadRequest<R> {
    /// Build a read envelope.
    #[must_use]
    pub fn new(sql: impl Into<String>, args: Vec<BindValue>, reply: Reply<ReadResult<R>>) -> Self {
        Self {
            sql: sql.into(),
            args,
            reply,
        }
    }

    /// Query text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(&self) -> &[BindValue] {
        &self.args
    }

    /// Whether the submitter already stopped waiting for this request.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_abandoned()
    }

    /// Take the envelope apart for execution.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<BindValue>, Reply<ReadResult<R>>) {
        (self.sql, self.args, self.reply)
    }
}

impl<R> fmt::Debug for ReadRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("sql", &self.sql)
            .field("args", &self.args.len())
            .finish_non_exhaustive()
    }
}

/// A parameterized mutation on its way to a worker.
pub struct MutationRequest {
    sql: String,
    args: Vec<BindValue>,
    reply: Reply<MutationResult>,
}

impl MutationRequest {
    /// Build a mutation envelope.
    #[must_use]
    pub fn new(sql: impl Into<String>, args: Vec<BindValue>, reply: Reply<MutationResult>) -> Self {
        Self {
            sql: sql.into(),
            args,
            reply,
        }
    }

    /// Statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(&self) -> &[BindValue] {
        &self.args
    }

    /// Whether the submitter already stopped waiting for this request.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_abandoned()
    }

    /// Take the envelope apart for execution.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<BindValue>, Reply<MutationResult>) {
        (self.sql, self.args, self.reply)
    }
}

impl fmt::Debug for MutationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRequest")
            .field("sql", &self.sql)
            .field("args", &self.args.len())
            .finish_non_exhaustive()
    }
}
