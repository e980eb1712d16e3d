//! Connection provider over a sqlx `Any` pool.
//!
//! Reads hold one pooled connection for as long as their cursor is open:
//! a pump task streams rows from the driver into the cursor's sink and
//! returns the connection when the cursor is closed, dropped, or drained.

use crate::config::DatabaseConfig;
use futures::StreamExt;
use querybus_core::{
    BindValue, ConnectionProvider, ExecutionError, ExecutionSummary, MutationResult,
    ProviderFuture, ReadResult, RowCursor, StartupError,
};
use querybus_runtime::HealthCheck;
use querybus_runtime::retry::retry_with_predicate;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow, install_default_drivers};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use std::fmt;

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// [`ConnectionProvider`] backed by a sqlx connection pool.
///
/// Cloning shares the pool.
#[derive(Clone)]
pub struct SqlxConnectionProvider {
    pool: AnyPool,
    row_buffer: usize,
}

impl SqlxConnectionProvider {
    /// Connect to the configured database.
    ///
    /// The pool keeps at least `max_idle_connections` open and never more
    /// than `max_open_connections`. The first connection is verified with
    /// `SELECT 1`; connection failures are retried under
    /// `config.connect_retry`, while a rejected login or unknown database
    /// fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::InvalidConfig`] for an invalid config and
    /// [`StartupError::Connect`] if the database cannot be reached.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StartupError> {
        config.validate()?;
        install_default_drivers();

        tracing::info!(
            driver = %config.driver,
            dsn = %config.redacted_dsn(),
            max_open = config.max_open_connections,
            max_idle = config.max_idle_connections,
            "Connecting to database"
        );

        let options = AnyPoolOptions::new()
            .max_connections(config.max_open_connections)
            .min_connections(config.max_idle_connections)
            .acquire_timeout(config.acquire_timeout);
        let dsn = config.dsn();

        let pool = retry_with_predicate(
            config.connect_retry.clone(),
            || {
                let options = options.clone();
                let dsn = dsn.as_str();
                async move {
                    let pool = options.connect(dsn).await?;
                    sqlx::query("SELECT 1").execute(&pool).await?;
                    Ok::<_, sqlx::Error>(pool)
                }
            },
            is_transient,
        )
        .await
        .map_err(|e| {
            tracing::error!(dsn = %config.redacted_dsn(), error = %e, "Database connection failed");
            StartupError::Connect(e.to_string())
        })?;

        tracing::info!(driver = %config.driver, "Database connection established");
        Ok(Self::from_pool(pool, config.row_buffer))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: AnyPool, row_buffer: usize) -> Self {
        Self { pool, row_buffer }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Pool health: unhealthy once closed, with open and idle counts.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        const COMPONENT: &str = "database";

        let check = if self.pool.is_closed() {
            HealthCheck::unhealthy(COMPONENT, "connection pool closed")
        } else {
            HealthCheck::healthy(COMPONENT)
        };
        check
            .with_metadata("connections", self.pool.size().to_string())
            .with_metadata("idle", self.pool.num_idle().to_string())
    }

    /// Close the pool, waiting for checked-out connections to come back.
    ///
    /// Call after the bus has shut down, so no read holds a connection.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database pool closed");
    }
}

impl fmt::Debug for SqlxConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlxConnectionProvider")
            .field("connections", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .field("row_buffer", &self.row_buffer)
            .finish()
    }
}

impl ConnectionProvider for SqlxConnectionProvider {
    type Row = AnyRow;

    fn name(&self) -> &str {
        "sqlx"
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        args: &'a [BindValue],
    ) -> ProviderFuture<'a, ReadResult<Self::Row>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(|e| {
                metrics::counter!("querybus_provider_errors_total", "kind" => "acquire").increment(1);
                map_sqlx_error(e)
            })?;
            let (sink, cursor) = RowCursor::channel(self.row_buffer);
            let sql = sql.to_string();
            let args = args.to_vec();

            tokio::spawn(async move {
                let mut rows = bind_all(sqlx::query(&sql), &args).fetch(&mut *conn);
                while let Some(row) = rows.next().await {
                    match row {
                        Ok(row) => {
                            if !sink.push(row).await {
                                tracing::trace!("Cursor closed before result set was drained");
                                break;
                            }
                        }
                        Err(e) => {
                            metrics::counter!("querybus_provider_errors_total", "kind" => "query")
                                .increment(1);
                            sink.fail(map_sqlx_error(e)).await;
                            break;
                        }
                    }
                }
            });

            cursor.prefetch().await
        })
    }

    fn execute<'a>(
        &'a self,
        sql: &'a str,
        args: &'a [BindValue],
    ) -> ProviderFuture<'a, MutationResult> {
        Box::pin(async move {
            let result = bind_all(sqlx::query(sql), args)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    metrics::counter!("querybus_provider_errors_total", "kind" => "execute")
                        .increment(1);
                    map_sqlx_error(e)
                })?;

            let summary = ExecutionSummary::new(result.rows_affected());
            Ok(match result.last_insert_id() {
                Some(id) => summary.with_last_insert_id(id),
                None => summary,
            })
        })
    }
}

/// Bind every argument in order.
///
/// `Null` goes out text-typed; `PostgreSQL` rejects it for other column
/// types unless the statement casts the parameter.
fn bind_all<'q>(mut query: AnyQuery<'q>, args: &[BindValue]) -> AnyQuery<'q> {
    for arg in args {
        query = match arg {
            BindValue::Null => query.bind(None::<String>),
            BindValue::Bool(v) => query.bind(*v),
            BindValue::Int(v) => query.bind(*v),
            BindValue::Float(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.clone()),
            BindValue::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Decode every column of a row into driver-neutral values.
///
/// Columns are tried as bool, integer, float, text and bytes in that order;
/// a SQL `NULL` of any type becomes [`BindValue::Null`].
///
/// # Errors
///
/// Returns [`ExecutionError::Decode`] for a column none of those fit.
pub fn decode_row(row: &AnyRow) -> Result<Vec<BindValue>, ExecutionError> {
    (0..row.len()).map(|index| decode_column(row, index)).collect()
}

fn decode_column(row: &AnyRow, index: usize) -> Result<BindValue, ExecutionError> {
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return Ok(value.map_or(BindValue::Null, BindValue::Bool));
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map_or(BindValue::Null, BindValue::Int));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value.map_or(BindValue::Null, BindValue::Float));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value.map_or(BindValue::Null, BindValue::Text));
    }
    row.try_get::<Option<Vec<u8>>, _>(index)
        .map(|value| value.map_or(BindValue::Null, BindValue::Bytes))
        .map_err(map_sqlx_error)
}

/// Map a sqlx error onto the bus's execution error taxonomy.
#[must_use]
pub fn map_sqlx_error(error: sqlx::Error) -> ExecutionError {
    match &error {
        sqlx::Error::Database(db) => ExecutionError::Rejected {
            code: db.code().map(|code| code.into_owned()),
            message: db.message().to_string(),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExecutionError::Connection(error.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. } => ExecutionError::Decode(error.to_string()),
        _ => ExecutionError::Other(error.to_string()),
    }
}

/// Errors worth another connection attempt at startup.
fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_map_to_connection() {
        let error = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(error.is_connection());

        let io = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(map_sqlx_error(io).is_connection());
    }

    #[test]
    fn decode_failures_map_to_decode() {
        let error = map_sqlx_error(sqlx::Error::ColumnNotFound("email".to_string()));
        assert!(matches!(error, ExecutionError::Decode(_)));
    }

    #[test]
    fn missing_rows_are_other() {
        let error = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(matches!(error, ExecutionError::Other(_)));
    }

    #[test]
    fn only_connection_trouble_is_retried() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::Configuration("bad url".into())));
    }
}
