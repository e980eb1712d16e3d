//! Bus configuration.
//!
//! Loads from environment variables with defaults, the same way the
//! application binaries do. Sizes are fixed for the lifetime of a bus.

use querybus_core::StartupError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default queue capacity for the shared read and mutation queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Default queue capacity for each shard lane.
pub const DEFAULT_LANE_CAPACITY: usize = 128;

/// Largest queue capacity a tokio mpsc channel accepts.
pub const MAX_QUEUE_CAPACITY: usize = usize::MAX >> 3;

/// How a request's time budget is split between enqueue and reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// One budget covers enqueue and reply together.
    #[default]
    TotalRequest,
    /// The reply wait gets a fresh budget once the envelope is enqueued.
    ///
    /// A request may take up to twice its budget end to end.
    PerPhase,
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TotalRequest => write!(f, "total_request"),
            Self::PerPhase => write!(f, "per_phase"),
        }
    }
}

impl FromStr for TimeoutPolicy {
    type Err = StartupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "total" | "total_request" | "total-request" => Ok(Self::TotalRequest),
            "per_phase" | "per-phase" | "phase" => Ok(Self::PerPhase),
            other => Err(StartupError::InvalidConfig(format!(
                "unknown timeout policy '{other}'"
            ))),
        }
    }
}

/// Query bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Workers per request class, and number of shard lanes.
    ///
    /// Usually the provider's maximum open connection count.
    pub pool_size: usize,
    /// Capacity of the shared read queue and of the shared mutation queue.
    pub queue_capacity: usize,
    /// Capacity of each shard lane's queue.
    pub lane_capacity: usize,
    /// Split of each request's budget between its two waits.
    pub timeout_policy: TimeoutPolicy,
    /// Budget used by callers that do not bring their own.
    pub default_budget: Duration,
    /// How long shutdown waits for workers to drain.
    pub drain_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            timeout_policy: TimeoutPolicy::TotalRequest,
            default_budget: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    /// Load configuration from `QUERYBUS_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults; an
    /// unknown timeout policy is an error.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::InvalidConfig`] if `QUERYBUS_TIMEOUT_POLICY`
    /// names an unknown policy or the resulting config fails [`validate`].
    ///
    /// [`validate`]: Self::validate
    pub fn from_env() -> Result<Self, StartupError> {
        let defaults = Self::default();
        let timeout_policy = match env::var("QUERYBUS_TIMEOUT_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.timeout_policy,
        };

        let config = Self {
            pool_size: parse_var("QUERYBUS_POOL_SIZE").unwrap_or(defaults.pool_size),
            queue_capacity: parse_var("QUERYBUS_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            lane_capacity: parse_var("QUERYBUS_LANE_CAPACITY").unwrap_or(defaults.lane_capacity),
            timeout_policy,
            default_budget: parse_var("QUERYBUS_DEFAULT_BUDGET_MS")
                .map_or(defaults.default_budget, Duration::from_millis),
            drain_timeout: parse_var("QUERYBUS_DRAIN_TIMEOUT_MS")
                .map_or(defaults.drain_timeout, Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the number of workers per class and shard lanes.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the shared queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the per-lane queue capacity.
    #[must_use]
    pub const fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity;
        self
    }

    /// Set the timeout policy.
    #[must_use]
    pub const fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the default request budget.
    #[must_use]
    pub const fn with_default_budget(mut self, budget: Duration) -> Self {
        self.default_budget = budget;
        self
    }

    /// Set the shutdown drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Check that every size is non-zero and every queue fits a channel.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), StartupError> {
        let sizes = [
            ("pool_size", self.pool_size),
            ("queue_capacity", self.queue_capacity),
            ("lane_capacity", self.lane_capacity),
        ];
        if let Some((field, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(StartupError::InvalidConfig(format!(
                "{field} must be greater than zero"
            )));
        }
        let capacities = [
            ("queue_capacity", self.queue_capacity),
            ("lane_capacity", self.lane_capacity),
        ];
        if let Some((field, value)) = capacities
            .iter()
            .find(|(_, value)| *value > MAX_QUEUE_CAPACITY)
        {
            return Err(StartupError::InvalidConfig(format!(
                "{field} {value} exceeds the maximum of {MAX_QUEUE_CAPACITY}"
            )));
        }
        if self.default_budget.is_zero() {
            return Err(StartupError::InvalidConfig(
                "default_budget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pump_sizes() {
        let config = BusConfig::default();
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.lane_capacity, 128);
        assert_eq!(config.timeout_policy, TimeoutPolicy::TotalRequest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = BusConfig::default().with_pool_size(0).validate().unwrap_err();
        assert!(err.to_string().contains("pool_size"));

        let err = BusConfig::default()
            .with_lane_capacity(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("lane_capacity"));

        let err = BusConfig::default()
            .with_default_budget(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, StartupError::InvalidConfig(_)));
    }

    #[test]
    fn oversized_queues_are_rejected() {
        let err = BusConfig::default()
            .with_queue_capacity(usize::MAX)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));

        let err = BusConfig::default()
            .with_lane_capacity(MAX_QUEUE_CAPACITY + 1)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("lane_capacity"));

        assert!(
            BusConfig::default()
                .with_queue_capacity(MAX_QUEUE_CAPACITY)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("total".parse::<TimeoutPolicy>().ok(), Some(TimeoutPolicy::TotalRequest));
        assert_eq!("PER_PHASE".parse::<TimeoutPolicy>().ok(), Some(TimeoutPolicy::PerPhase));
        assert!("forever".parse::<TimeoutPolicy>().is_err());
        assert_eq!(TimeoutPolicy::PerPhase.to_string(), "per_phase");
    }
}
