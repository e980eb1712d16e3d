//! Prometheus metrics for the query bus.
//!
//! Everything is recorded through the `metrics` facade, so nothing is
//! exported unless a recorder is installed. [`MetricsServer`] installs the
//! Prometheus one.
//!
//! # Example
//!
//! ```rust,no_run
//! use querybus_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use querybus_core::RequestClass;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Envelopes accepted onto a queue.
pub const REQUESTS_ENQUEUED: &str = "querybus_requests_enqueued_total";
/// Submissions that gave up while the queue was full.
pub const ENQUEUE_TIMEOUTS: &str = "querybus_enqueue_timeouts_total";
/// Submissions that gave up waiting for a reply.
pub const REPLY_TIMEOUTS: &str = "querybus_reply_timeouts_total";
/// Envelopes executed by a worker, labelled by outcome.
pub const REQUESTS_EXECUTED: &str = "querybus_requests_executed_total";
/// Envelopes skipped because their caller had already gone.
pub const REQUESTS_ABANDONED: &str = "querybus_requests_abandoned_total";
/// Provider panics caught by a worker.
pub const WORKER_PANICS: &str = "querybus_worker_panics_total";
/// Time spent inside the provider per envelope.
pub const EXECUTION_DURATION: &str = "querybus_execution_duration_seconds";
/// Envelopes waiting in a queue.
pub const QUEUE_DEPTH: &str = "querybus_queue_depth";
/// Shutdown lifecycle events, labelled by phase.
pub const SHUTDOWNS: &str = "querybus_shutdown_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the bus metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr`. Nothing is installed until [`start`](Self::start).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the bus metrics and install the Prometheus recorder.
    ///
    /// A recorder that is already installed (another server, or an earlier
    /// test) is not an error; [`render`](Self::render) then returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// Address the metrics endpoint is meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(REQUESTS_ENQUEUED, "Envelopes accepted onto a bus queue");
    describe_counter!(
        ENQUEUE_TIMEOUTS,
        "Submissions abandoned because the queue stayed full"
    );
    describe_counter!(
        REPLY_TIMEOUTS,
        "Submissions abandoned while waiting for a reply"
    );
    describe_counter!(REQUESTS_EXECUTED, "Envelopes executed by a worker");
    describe_counter!(
        REQUESTS_ABANDONED,
        "Envelopes skipped because the caller stopped waiting before dequeue"
    );
    describe_counter!(WORKER_PANICS, "Provider panics caught by a worker");
    describe_histogram!(EXECUTION_DURATION, "Time spent executing one envelope");
    describe_gauge!(QUEUE_DEPTH, "Envelopes waiting in a queue");
    describe_counter!(SHUTDOWNS, "Bus shutdown lifecycle events");
}

/// Recorder used by the bus and its workers.
pub struct BusMetrics;

impl BusMetrics {
    /// An envelope was accepted onto a queue.
    pub fn record_enqueued(class: RequestClass) {
        counter!(REQUESTS_ENQUEUED, "class" => class.as_str()).increment(1);
    }

    /// A submission timed out before its envelope was accepted.
    pub fn record_enqueue_timeout(class: RequestClass) {
        counter!(ENQUEUE_TIMEOUTS, "class" => class.as_str()).increment(1);
    }

    /// A submission timed out waiting for its reply.
    pub fn record_reply_timeout(class: RequestClass) {
        counter!(REPLY_TIMEOUTS, "class" => class.as_str()).increment(1);
    }

    /// A worker finished an envelope.
    pub fn record_execution(class: RequestClass, succeeded: bool, duration: Duration) {
        let outcome = if succeeded { "ok" } else { "error" };
        counter!(REQUESTS_EXECUTED, "class" => class.as_str(), "outcome" => outcome).increment(1);
        histogram!(EXECUTION_DURATION, "class" => class.as_str()).record(duration.as_secs_f64());
    }

    /// A worker skipped an envelope nobody was waiting for.
    pub fn record_abandoned(class: RequestClass) {
        counter!(REQUESTS_ABANDONED, "class" => class.as_str()).increment(1);
    }

    /// A worker caught a provider panic.
    pub fn record_panic(class: RequestClass) {
        counter!(WORKER_PANICS, "class" => class.as_str()).increment(1);
    }

    /// Current depth of a named queue.
    #[allow(clippy::cast_precision_loss)] // queue depths are far below 2^52
    pub fn record_queue_depth(pool: &str, depth: usize) {
        gauge!(QUEUE_DEPTH, "pool" => pool.to_string()).set(depth as f64);
    }

    /// A shutdown phase was reached: `initiated`, `completed` or `timeout`.
    pub fn record_shutdown(phase: &'static str) {
        counter!(SHUTDOWNS, "phase" => phase).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorded_metrics_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        BusMetrics::record_enqueued(RequestClass::Mutation);
        BusMetrics::record_execution(RequestClass::Read, true, Duration::from_millis(3));
        BusMetrics::record_queue_depth("read", 2);

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains(REQUESTS_ENQUEUED));
            assert!(rendered.contains(EXECUTION_DURATION));
            assert!(rendered.contains(QUEUE_DEPTH));
        }
    }
}
