//! Caller-side timeout and correlation protocol.
//!
//! Every submission is one round trip: reserve a slot on the target queue,
//! hand over an envelope carrying a fresh reply conduit, then wait on that
//! conduit. Each phase is its own `timeout_at` on an absolute deadline, so
//! the first wait cannot consume the second one's timer.
//!
//! Under [`TimeoutPolicy::TotalRequest`] both deadlines are the same
//! instant: time spent waiting for queue space is time the reply no longer
//! has. Under [`TimeoutPolicy::PerPhase`] a relative budget restarts once
//! the envelope is enqueued.

use crate::config::TimeoutPolicy;
use crate::metrics::BusMetrics;
use querybus_core::{BusError, ExecutionError, Reply, RequestClass, reply_channel};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Stand-in for "no deadline" when a budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, saturating at a far-future instant.
fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Time a caller is willing to spend on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBudget {
    /// Relative to the moment the request is submitted.
    Within(Duration),
    /// An absolute deadline.
    ///
    /// Lets a handler spread one budget over several sequential requests:
    /// each round trip only gets what the previous ones left.
    Until(Instant),
}

impl RequestBudget {
    /// An absolute budget starting now, for sharing across round trips.
    #[must_use]
    pub fn shared(budget: Duration) -> Self {
        Self::Until(deadline_after(Instant::now(), budget))
    }

    /// Deadline for a phase that starts at `start`.
    #[must_use]
    pub fn deadline_from(self, start: Instant) -> Instant {
        match self {
            Self::Within(budget) => deadline_after(start, budget),
            Self::Until(deadline) => deadline,
        }
    }

    /// Time left before the deadline, measured from now.
    #[must_use]
    pub fn remaining(self) -> Duration {
        match self {
            Self::Within(budget) => budget,
            Self::Until(deadline) => deadline.saturating_duration_since(Instant::now()),
        }
    }

    /// Whether an absolute budget has already run out.
    #[must_use]
    pub fn is_expired(self) -> bool {
        matches!(self, Self::Until(deadline) if deadline <= Instant::now())
    }
}

impl From<Duration> for RequestBudget {
    fn from(budget: Duration) -> Self {
        Self::Within(budget)
    }
}

impl From<Instant> for RequestBudget {
    fn from(deadline: Instant) -> Self {
        Self::Until(deadline)
    }
}

/// Submit one envelope on `queue` and wait for its result.
///
/// `build` receives the reply conduit and returns the envelope. It is only
/// called once a queue slot has been reserved, so an enqueue timeout never
/// leaves an orphaned envelope behind.
pub(crate) async fn round_trip<J, T>(
    queue: &mpsc::Sender<J>,
    class: RequestClass,
    budget: RequestBudget,
    policy: TimeoutPolicy,
    build: impl FnOnce(Reply<Result<T, ExecutionError>>) -> J,
) -> Result<T, BusError> {
    let enqueue_deadline = budget.deadline_from(Instant::now());

    let permit = match timeout_at(enqueue_deadline, queue.reserve()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return Err(BusError::Closed),
        Err(_) => {
            tracing::warn!(%class, "Queue full for the whole budget");
            BusMetrics::record_enqueue_timeout(class);
            return Err(BusError::EnqueueTimeout { class });
        }
    };

    let (reply, receiver) = reply_channel();
    permit.send(build(reply));
    BusMetrics::record_enqueued(class);

    let reply_deadline = match policy {
        TimeoutPolicy::TotalRequest => enqueue_deadline,
        TimeoutPolicy::PerPhase => budget.deadline_from(Instant::now()),
    };

    match timeout_at(reply_deadline, receiver).await {
        Ok(Ok(result)) => result.map_err(BusError::from),
        Ok(Err(_)) => Err(BusError::WorkerLost),
        Err(_) => {
            tracing::warn!(%class, "No reply within budget; request may still run");
            BusMetrics::record_reply_timeout(class);
            Err(BusError::ReplyTimeout { class })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use querybus_core::{ExecutionSummary, MutationRequest, MutationResult};

    #[tokio::test(start_paused = true)]
    async fn enqueue_timeout_on_full_queue() {
        let (sender, _receiver) = mpsc::channel::<MutationRequest>(1);
        let (filler, _rx) = reply_channel::<MutationResult>();
        sender
            .try_send(MutationRequest::new("SELECT 1", Vec::new(), filler))
            .unwrap();

        let err = round_trip(
            &sender,
            RequestClass::Mutation,
            Duration::from_millis(50).into(),
            TimeoutPolicy::TotalRequest,
            |reply| MutationRequest::new("UPDATE t SET x = 1", Vec::new(), reply),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            BusError::EnqueueTimeout {
                class: RequestClass::Mutation
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_when_nobody_answers() {
        let (sender, mut receiver) = mpsc::channel::<MutationRequest>(1);
        let holder = tokio::spawn(async move { receiver.recv().await });

        let err = round_trip(
            &sender,
            RequestClass::Mutation,
            Duration::from_millis(50).into(),
            TimeoutPolicy::TotalRequest,
            |reply| MutationRequest::new("UPDATE t SET x = 1", Vec::new(), reply),
        )
        .await
        .unwrap_err();

        assert!(!err.outcome_known());
        drop(holder.await.unwrap());
    }

    #[tokio::test]
    async fn closed_queue_fails_fast() {
        let (sender, receiver) = mpsc::channel::<MutationRequest>(1);
        drop(receiver);

        let err = round_trip(
            &sender,
            RequestClass::Read,
            Duration::from_secs(1).into(),
            TimeoutPolicy::TotalRequest,
            |reply| MutationRequest::new("SELECT 1", Vec::new(), reply),
        )
        .await
        .unwrap_err();
        assert_eq!(err, BusError::Closed);
    }

    #[tokio::test]
    async fn dropped_reply_is_worker_lost() {
        let (sender, mut receiver) = mpsc::channel::<MutationRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                drop(request);
            }
        });

        let err = round_trip(
            &sender,
            RequestClass::Mutation,
            Duration::from_secs(1).into(),
            TimeoutPolicy::TotalRequest,
            |reply| MutationRequest::new("DELETE FROM cart", Vec::new(), reply),
        )
        .await
        .unwrap_err();
        assert_eq!(err, BusError::WorkerLost);
    }

    #[tokio::test]
    async fn result_is_delivered() {
        let (sender, mut receiver) = mpsc::channel::<MutationRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let (_, _, reply) = request.into_parts();
                reply.send(Ok(ExecutionSummary::new(3)));
            }
        });

        let summary = round_trip(
            &sender,
            RequestClass::Mutation,
            Duration::from_secs(1).into(),
            TimeoutPolicy::PerPhase,
            |reply| MutationRequest::new("UPDATE cart SET qty = 2", Vec::new(), reply),
        )
        .await
        .unwrap();
        assert_eq!(summary.rows_affected, 3);
    }

    /// Queue stays full for 80ms, then the consumer takes another 80ms to
    /// answer. Only a fresh reply budget survives both waits.
    async fn slow_queue(policy: TimeoutPolicy) -> Result<ExecutionSummary, BusError> {
        let (sender, mut receiver) = mpsc::channel::<MutationRequest>(1);
        let (filler, _rx) = reply_channel::<MutationResult>();
        sender
            .try_send(MutationRequest::new("SELECT 1", Vec::new(), filler))
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            drop(receiver.recv().await);
            if let Some(request) = receiver.recv().await {
                tokio::time::sleep(Duration::from_millis(80)).await;
                let (_, _, reply) = request.into_parts();
                reply.send(Ok(ExecutionSummary::new(1)));
            }
        });

        round_trip(
            &sender,
            RequestClass::Mutation,
            Duration::from_millis(100).into(),
            policy,
            |reply| MutationRequest::new("UPDATE cart SET qty = 2", Vec::new(), reply),
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn total_request_counts_queue_wait_against_reply() {
        let err = slow_queue(TimeoutPolicy::TotalRequest).await.unwrap_err();
        assert_eq!(
            err,
            BusError::ReplyTimeout {
                class: RequestClass::Mutation
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_phase_restarts_budget_after_enqueue() {
        let summary = slow_queue(TimeoutPolicy::PerPhase).await.unwrap();
        assert_eq!(summary.rows_affected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_budget_shrinks_across_round_trips() {
        let budget = RequestBudget::shared(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(budget.remaining(), Duration::from_millis(40));
        assert!(!budget.is_expired());

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(budget.is_expired());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn unbounded_budget_still_gets_a_result() {
        let (sender, mut receiver) = mpsc::channel::<MutationRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let (_, _, reply) = request.into_parts();
                reply.send(Ok(ExecutionSummary::new(1)));
            }
        });

        for policy in [TimeoutPolicy::TotalRequest, TimeoutPolicy::PerPhase] {
            let summary = round_trip(
                &sender,
                RequestClass::Mutation,
                Duration::MAX.into(),
                policy,
                |reply| MutationRequest::new("UPDATE cart SET qty = 2", Vec::new(), reply),
            )
            .await
            .unwrap();
            assert_eq!(summary.rows_affected, 1);
        }

        let shared = RequestBudget::shared(Duration::MAX);
        assert!(!shared.is_expired());
        assert!(shared.remaining() >= FAR_FUTURE - Duration::from_secs(1));
    }

    #[test]
    fn relative_budget_deadline() {
        let start = Instant::now();
        let budget = RequestBudget::from(Duration::from_millis(30));
        assert_eq!(budget.deadline_from(start), start + Duration::from_millis(30));
        assert!(!budget.is_expired());
    }
}
