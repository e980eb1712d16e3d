//! The query bus handle.
//!
//! [`QueryBus`] owns three sets of workers over one connection provider:
//!
//! - a read pool on the shared read queue,
//! - a mutation pool on the shared mutation queue,
//! - one single-worker lane per shard, each with its own queue.
//!
//! Reads and mutations never share a worker. The bus is built once at
//! startup and handed to every caller by cloning the handle; there is no
//! global registry.

use crate::config::BusConfig;
use crate::deadline::RequestBudget;
use crate::health::{DEGRADED_FILL_RATIO, HealthCheck};
use crate::metrics::BusMetrics;
use crate::pool::{QueueStats, WorkerPool};
use crate::shard::ShardRouter;
use futures::future::join_all;
use querybus_core::{
    BindValue, BusError, ConnectionProvider, ExecutionSummary, MutationRequest, ReadRequest,
    RequestClass, RowCursor, StartupError,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Queue snapshot for every pool and lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Shared read queue.
    pub reads: QueueStats,
    /// Shared mutation queue.
    pub mutations: QueueStats,
    /// Shard lanes, by index.
    pub lanes: Vec<QueueStats>,
}

impl BusStats {
    /// All queues, reads first.
    pub fn queues(&self) -> impl Iterator<Item = &QueueStats> {
        [&self.reads, &self.mutations].into_iter().chain(&self.lanes)
    }

    /// Envelopes waiting across every queue.
    #[must_use]
    pub fn total_depth(&self) -> usize {
        self.queues().map(|q| q.depth).sum()
    }
}

struct Inner<P: ConnectionProvider> {
    provider: Arc<P>,
    config: BusConfig,
    router: ShardRouter,
    reads: WorkerPool<ReadRequest<P::Row>>,
    mutations: WorkerPool<MutationRequest>,
    lanes: Vec<WorkerPool<MutationRequest>>,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    /// Outcome of the drain, set by the first shutdown caller.
    drained: Mutex<Option<Result<(), BusError>>>,
}

/// Handle to a running query bus.
///
/// Cheap to clone. Workers stop when [`shutdown`](Self::shutdown) is
/// called, or once the last handle is dropped.
///
/// # Example
///
/// ```
/// use querybus_runtime::{BusConfig, QueryBus};
/// use querybus_testing::{InMemoryConnectionProvider, insert_into};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = InMemoryConnectionProvider::new();
/// provider.on_execute("INSERT INTO emails (email) VALUES (?)", insert_into("emails"));
///
/// let bus = QueryBus::start(provider, BusConfig::default().with_pool_size(2))?;
/// let summary = bus
///     .submit_mutation(
///         "INSERT INTO emails (email) VALUES (?)",
///         vec!["kim@example.com".into()],
///         Duration::from_secs(1),
///     )
///     .await?;
/// assert_eq!(summary.rows_affected, 1);
///
/// bus.shutdown(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueryBus<P: ConnectionProvider> {
    inner: Arc<Inner<P>>,
}

impl<P: ConnectionProvider> Clone for QueryBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ConnectionProvider> fmt::Debug for QueryBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBus")
            .field("provider", &self.inner.provider.name())
            .field("pool_size", &self.inner.config.pool_size)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> QueryBus<P> {
    /// Spawn every pool and lane over `provider`.
    ///
    /// Must be called from within a tokio runtime; workers run on it.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::InvalidConfig`] if `config` fails validation
    /// or no tokio runtime is running.
    pub fn start(provider: P, config: BusConfig) -> Result<Self, StartupError> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StartupError::InvalidConfig(
                "QueryBus::start must be called from within a tokio runtime".to_string(),
            ));
        }

        let provider = Arc::new(provider);
        let (stop, stop_rx) = watch::channel(false);
        let size = config.pool_size;

        let reads = WorkerPool::spawn(
            "read",
            RequestClass::Read,
            size,
            config.queue_capacity,
            &provider,
            &stop_rx,
        );
        let mutations = WorkerPool::spawn(
            "mutation",
            RequestClass::Mutation,
            size,
            config.queue_capacity,
            &provider,
            &stop_rx,
        );
        let lanes = (0..size)
            .map(|lane| {
                WorkerPool::spawn(
                    format!("lane-{lane}"),
                    RequestClass::Sharded,
                    1,
                    config.lane_capacity,
                    &provider,
                    &stop_rx,
                )
            })
            .collect();

        tracing::info!(
            provider = provider.name(),
            pool_size = size,
            queue_capacity = config.queue_capacity,
            lane_capacity = config.lane_capacity,
            timeout_policy = %config.timeout_policy,
            "Query bus started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                router: ShardRouter::new(size),
                config,
                reads,
                mutations,
                lanes,
                closed: AtomicBool::new(false),
                stop,
                drained: Mutex::new(None),
            }),
        })
    }

    /// Run a read query without arguments.
    ///
    /// An empty result is an empty cursor, not an error.
    ///
    /// # Errors
    ///
    /// [`BusError::EnqueueTimeout`] or [`BusError::ReplyTimeout`] when the
    /// budget runs out, [`BusError::Execution`] when the store rejects the
    /// query, [`BusError::Closed`] after shutdown.
    pub async fn submit_read(
        &self,
        sql: impl Into<String>,
        budget: impl Into<RequestBudget>,
    ) -> Result<RowCursor<P::Row>, BusError> {
        self.submit_read_with_args(sql, Vec::new(), budget).await
    }

    /// Run a read query with positional arguments.
    ///
    /// # Errors
    ///
    /// Same as [`submit_read`](Self::submit_read).
    pub async fn submit_read_with_args(
        &self,
        sql: impl Into<String>,
        args: Vec<BindValue>,
        budget: impl Into<RequestBudget>,
    ) -> Result<RowCursor<P::Row>, BusError> {
        self.ensure_open()?;
        let sql = sql.into();
        let inner = &self.inner;
        inner
            .reads
            .submit(budget.into(), inner.config.timeout_policy, |reply| {
                ReadRequest::new(sql, args, reply)
            })
            .await
    }

    /// Run a mutation on the shared mutation pool.
    ///
    /// No ordering is promised relative to other mutations.
    ///
    /// # Errors
    ///
    /// Same as [`submit_read`](Self::submit_read). After a
    /// [`BusError::ReplyTimeout`] the mutation may still be applied.
    pub async fn submit_mutation(
        &self,
        sql: impl Into<String>,
        args: Vec<BindValue>,
        budget: impl Into<RequestBudget>,
    ) -> Result<ExecutionSummary, BusError> {
        self.ensure_open()?;
        let sql = sql.into();
        let inner = &self.inner;
        inner
            .mutations
            .submit(budget.into(), inner.config.timeout_policy, |reply| {
                MutationRequest::new(sql, args, reply)
            })
            .await
    }

    /// Run a mutation on the lane owned by `shard_key`.
    ///
    /// Mutations sharing a key run one at a time in submission order.
    ///
    /// # Errors
    ///
    /// Same as [`submit_mutation`](Self::submit_mutation).
    pub async fn submit_sharded_mutation(
        &self,
        shard_key: &str,
        sql: impl Into<String>,
        args: Vec<BindValue>,
        budget: impl Into<RequestBudget>,
    ) -> Result<ExecutionSummary, BusError> {
        self.ensure_open()?;
        let lane = self.shard_index(shard_key);
        tracing::trace!(shard_key, lane, "Routing sharded mutation");

        let sql = sql.into();
        let inner = &self.inner;
        let Some(pool) = inner.lanes.get(lane) else {
            return Err(BusError::Closed);
        };
        pool.submit(budget.into(), inner.config.timeout_policy, |reply| {
            MutationRequest::new(sql, args, reply)
        })
        .await
    }

    /// Lane a shard key is routed to.
    #[must_use]
    pub fn shard_index(&self, shard_key: &str) -> usize {
        self.inner.router.index_for(shard_key)
    }

    /// The configuration the bus was started with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// The provider behind the bus.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// Current queue depths.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let inner = &self.inner;
        let stats = BusStats {
            reads: inner.reads.stats(),
            mutations: inner.mutations.stats(),
            lanes: inner.lanes.iter().map(WorkerPool::stats).collect(),
        };
        for queue in stats.queues() {
            BusMetrics::record_queue_depth(&queue.name, queue.depth);
        }
        stats
    }

    /// Health of the bus.
    ///
    /// Unhealthy once closed; degraded while any queue is at least 80% full.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        const COMPONENT: &str = "query_bus";

        let stats = self.stats();
        let fullest = stats
            .queues()
            .max_by(|a, b| a.fill_ratio().total_cmp(&b.fill_ratio()));

        let mut check = if self.is_closed() {
            HealthCheck::unhealthy(COMPONENT, "bus is shut down")
        } else {
            match fullest {
                Some(queue) if queue.fill_ratio() >= DEGRADED_FILL_RATIO => {
                    // Truncation is fine for a display percentage.
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let percent = (queue.fill_ratio() * 100.0) as u32;
                    HealthCheck::degraded(
                        COMPONENT,
                        format!("queue '{}' is {percent}% full", queue.name),
                    )
                }
                _ => HealthCheck::healthy(COMPONENT),
            }
        };

        check = check
            .with_metadata("provider", self.inner.provider.name())
            .with_metadata("total_depth", stats.total_depth().to_string());
        for queue in stats.queues() {
            check = check.with_metadata(
                format!("{}_depth", queue.name),
                format!("{}/{}", queue.depth, queue.capacity),
            );
        }
        check
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting requests and drain every queue.
    ///
    /// New submissions fail with [`BusError::Closed`] immediately. Envelopes
    /// already queued are still executed and answered. Workers that have not
    /// finished within `timeout` are aborted; their callers see
    /// [`BusError::WorkerLost`].
    ///
    /// Concurrent and later calls wait for the first caller's drain and
    /// return its outcome; their own `timeout` is not applied.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutdownTimeout`] with the number of aborted
    /// workers if draining took longer than `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), BusError> {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Initiating query bus shutdown");
            BusMetrics::record_shutdown("initiated");
        }
        inner.stop.send_replace(true);

        let mut drained = inner.drained.lock().await;
        if let Some(outcome) = drained.as_ref() {
            return outcome.clone();
        }
        let outcome = self.drain(timeout).await;
        *drained = Some(outcome.clone());
        outcome
    }

    async fn drain(&self, timeout: Duration) -> Result<(), BusError> {
        let inner = &self.inner;
        let mut workers: Vec<JoinHandle<()>> = inner.reads.take_workers().await;
        workers.extend(inner.mutations.take_workers().await);
        for lane in &inner.lanes {
            workers.extend(lane.take_workers().await);
        }

        let started = tokio::time::Instant::now();
        if tokio::time::timeout(timeout, join_all(workers.iter_mut()))
            .await
            .is_ok()
        {
            tracing::info!(
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Query bus drained, shutdown complete"
            );
            BusMetrics::record_shutdown("completed");
            return Ok(());
        }

        let stragglers: Vec<_> = workers.iter().filter(|w| !w.is_finished()).collect();
        let pending = stragglers.len();
        for worker in stragglers {
            worker.abort();
        }
        tracing::error!(pending_workers = pending, "Shutdown timed out, aborting workers");
        BusMetrics::record_shutdown("timeout");
        Err(BusError::ShutdownTimeout(pending))
    }

    /// [`shutdown`](Self::shutdown) with the configured drain timeout.
    ///
    /// # Errors
    ///
    /// Same as [`shutdown`](Self::shutdown).
    pub async fn shutdown_with_default(&self) -> Result<(), BusError> {
        self.shutdown(self.inner.config.drain_timeout).await
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use querybus_testing::{InMemoryConnectionProvider, insert_into};

    fn bus(config: BusConfig) -> QueryBus<InMemoryConnectionProvider> {
        let provider = InMemoryConnectionProvider::new();
        provider.on_execute("INSERT INTO emails (email) VALUES (?)", insert_into("emails"));
        QueryBus::start(provider, config).unwrap()
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let err = QueryBus::start(InMemoryConnectionProvider::new(), BusConfig::default())
            .unwrap_err();
        assert!(matches!(err, StartupError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let err = QueryBus::start(
            InMemoryConnectionProvider::new(),
            BusConfig::default().with_queue_capacity(0),
        )
        .unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));

        let err = QueryBus::start(
            InMemoryConnectionProvider::new(),
            BusConfig::default().with_queue_capacity(usize::MAX),
        )
        .unwrap_err();
        assert!(matches!(err, StartupError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn stats_cover_every_queue() {
        let bus = bus(BusConfig::default().with_pool_size(3).with_queue_capacity(16));
        let stats = bus.stats();
        assert_eq!(stats.reads.capacity, 16);
        assert_eq!(stats.reads.workers, 3);
        assert_eq!(stats.lanes.len(), 3);
        assert!(stats.lanes.iter().all(|lane| lane.workers == 1));
        assert_eq!(stats.total_depth(), 0);
        assert!(bus.health().status.is_healthy());
    }

    #[tokio::test]
    async fn closed_bus_rejects_and_reports_unhealthy() {
        let bus = bus(BusConfig::default().with_pool_size(1));
        bus.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = bus
            .submit_mutation(
                "INSERT INTO emails (email) VALUES (?)",
                vec!["late@example.com".into()],
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Closed);
        assert!(bus.health().status.is_unhealthy());
        assert!(bus.shutdown(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn shard_index_is_stable() {
        let bus = bus(BusConfig::default().with_pool_size(4));
        let first = bus.shard_index("user-42");
        assert_eq!(first, bus.clone().shard_index("user-42"));
        assert!(first < 4);
    }
}
