//! Fixed-size worker pools over bounded queues.
//!
//! A pool is one bounded tokio mpsc queue and `size` long-lived worker
//! tasks sharing its receiver behind an async mutex. Whichever idle worker
//! holds the lock takes the next envelope, so hand-off is FIFO. A worker
//! runs one envelope at a time and always writes exactly one result before
//! taking the next.
//!
//! Stopping is cooperative: once the stop signal flips, the first worker to
//! see it closes the receiver, and workers keep draining buffered envelopes
//! until the queue reports closed and empty.

use crate::config::TimeoutPolicy;
use crate::deadline::{RequestBudget, round_trip};
use crate::metrics::BusMetrics;
use futures::FutureExt;
use querybus_core::{
    BindValue, BusError, ConnectionProvider, ExecutionError, MutationRequest, ProviderFuture,
    ReadRequest, Reply, RequestClass, RowCursor,
};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// An envelope a worker knows how to run against a provider.
pub(crate) trait Job<P: ConnectionProvider>: Send + 'static {
    /// Value carried by a successful result.
    type Success: Send + 'static;

    /// Whether the submitter already stopped listening.
    fn is_abandoned(&self) -> bool;

    /// Take the envelope apart.
    fn into_parts(self) -> (String, Vec<BindValue>, Reply<Result<Self::Success, ExecutionError>>);

    /// Run the statement.
    fn dispatch<'a>(
        provider: &'a P,
        sql: &'a str,
        args: &'a [BindValue],
    ) -> ProviderFuture<'a, Result<Self::Success, ExecutionError>>;
}

impl<P: ConnectionProvider> Job<P> for ReadRequest<P::Row> {
    type Success = RowCursor<P::Row>;

    fn is_abandoned(&self) -> bool {
        ReadRequest::is_abandoned(self)
    }

    fn into_parts(self) -> (String, Vec<BindValue>, Reply<Result<Self::Success, ExecutionError>>) {
        ReadRequest::into_parts(self)
    }

    fn dispatch<'a>(
        provider: &'a P,
        sql: &'a str,
        args: &'a [BindValue],
    ) -> ProviderFuture<'a, Result<Self::Success, ExecutionError>> {
        provider.query(sql, args)
    }
}

impl<P: ConnectionProvider> Job<P> for MutationRequest {
    type Success = querybus_core::ExecutionSummary;

    fn is_abandoned(&self) -> bool {
        MutationRequest::is_abandoned(self)
    }

    fn into_parts(self) -> (String, Vec<BindValue>, Reply<Result<Self::Success, ExecutionError>>) {
        MutationRequest::into_parts(self)
    }

    fn dispatch<'a>(
        provider: &'a P,
        sql: &'a str,
        args: &'a [BindValue],
    ) -> ProviderFuture<'a, Result<Self::Success, ExecutionError>> {
        provider.execute(sql, args)
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name: `read`, `mutation` or `lane-<n>`.
    pub name: String,
    /// Envelopes waiting (including reserved slots).
    pub depth: usize,
    /// Maximum envelopes the queue holds.
    pub capacity: usize,
    /// Workers serving the queue.
    pub workers: usize,
}

impl QueueStats {
    /// Fraction of capacity in use, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // queue sizes are far below 2^52
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.depth as f64 / self.capacity as f64
    }
}

/// A queue and the workers draining it.
pub(crate) struct WorkerPool<J> {
    name: Arc<str>,
    class: RequestClass,
    sender: mpsc::Sender<J>,
    size: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J> WorkerPool<J> {
    /// Create the queue and spawn `size` workers on the current runtime.
    ///
    /// `capacity` must already be validated by [`BusConfig::validate`](crate::BusConfig::validate).
    pub(crate) fn spawn<P>(
        name: impl Into<Arc<str>>,
        class: RequestClass,
        size: usize,
        capacity: usize,
        provider: &Arc<P>,
        stop: &watch::Receiver<bool>,
    ) -> Self
    where
        P: ConnectionProvider,
        J: Job<P>,
    {
        let name: Arc<str> = name.into();
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| {
                let worker = Worker {
                    pool: Arc::clone(&name),
                    class,
                    provider: Arc::clone(provider),
                    receiver: Arc::clone(&receiver),
                    stop: stop.clone(),
                };
                let span = tracing::info_span!("worker", pool = %name, worker = index);
                tokio::spawn(worker.run().instrument(span))
            })
            .collect();

        tracing::debug!(pool = %name, workers = size, capacity, "Worker pool started");

        Self {
            name,
            class,
            sender,
            size,
            workers: Mutex::new(workers),
        }
    }

    /// Submit through this pool's queue and wait for the result.
    pub(crate) async fn submit<T>(
        &self,
        budget: RequestBudget,
        policy: TimeoutPolicy,
        build: impl FnOnce(Reply<Result<T, ExecutionError>>) -> J,
    ) -> Result<T, BusError> {
        round_trip(&self.sender, self.class, budget, policy, build).await
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let capacity = self.sender.max_capacity();
        QueueStats {
            name: self.name.to_string(),
            depth: capacity.saturating_sub(self.sender.capacity()),
            capacity,
            workers: self.size,
        }
    }

    /// Hand over the worker handles. Later calls get nothing.
    pub(crate) async fn take_workers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.workers.lock().await)
    }
}

struct Worker<P, J> {
    pool: Arc<str>,
    class: RequestClass,
    provider: Arc<P>,
    receiver: Arc<Mutex<mpsc::Receiver<J>>>,
    stop: watch::Receiver<bool>,
}

impl<P, J> Worker<P, J>
where
    P: ConnectionProvider,
    J: Job<P>,
{
    async fn run(mut self) {
        tracing::trace!("Worker waiting for envelopes");
        while let Some(job) = self.next_job().await {
            if job.is_abandoned() {
                tracing::debug!(class = %self.class, "Caller already gone, skipping envelope");
                BusMetrics::record_abandoned(self.class);
                continue;
            }
            self.execute(job).await;
        }
        tracing::debug!("Queue closed and drained, worker exiting");
    }

    /// Next envelope, or `None` once the queue is closed and empty.
    async fn next_job(&mut self) -> Option<J> {
        let mut receiver = self.receiver.lock().await;
        let stopping = *self.stop.borrow();
        let job = if stopping {
            receiver.close();
            receiver.recv().await
        } else {
            tokio::select! {
                job = receiver.recv() => job,
                _ = self.stop.changed() => {
                    tracing::debug!("Stop signal received, draining queue");
                    receiver.close();
                    receiver.recv().await
                }
            }
        };
        BusMetrics::record_queue_depth(&self.pool, receiver.len());
        job
    }

    async fn execute(&self, job: J) {
        let (sql, args, reply) = job.into_parts();
        let started = Instant::now();

        let dispatched = AssertUnwindSafe(async { J::dispatch(&self.provider, &sql, &args).await })
            .catch_unwind()
            .await;
        let result = dispatched.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(class = %self.class, panic = %message, "Provider panicked");
            BusMetrics::record_panic(self.class);
            Err(ExecutionError::Panicked(message))
        });

        let elapsed = started.elapsed();
        BusMetrics::record_execution(self.class, result.is_ok(), elapsed);
        if let Err(error) = &result {
            tracing::debug!(
                class = %self.class,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                %error,
                "Statement failed"
            );
        }

        if !reply.send(result) {
            tracing::debug!(class = %self.class, "Caller stopped waiting, result discarded");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
