//! Health reporting.
//!
//! The bus reports on itself through [`HealthCheck`]; applications combine
//! it with their own checks in a [`HealthReport`].

use serde::Serialize;
use std::fmt;

/// Queue fill ratio at which the bus reports itself degraded.
pub const DEGRADED_FILL_RATIO: f64 = 0.8;

/// Health check status levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational, but callers are likely to see timeouts.
    Degraded,
    /// Not accepting work.
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The worse of two statuses.
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Component name.
    pub component: String,
    /// Current status.
    pub status: HealthStatus,
    /// Why the component is not healthy.
    pub message: Option<String>,
    /// Extra key/value details, such as queue depths.
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// A degraded component.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// An unhealthy component.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(
        component: impl Into<String>,
        status: HealthStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Look up a detail by key.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Combined health of several components.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among the checks.
    pub status: HealthStatus,
    /// Individual component checks.
    pub checks: Vec<HealthCheck>,
    /// When the report was taken.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Combine checks; the overall status is the worst one.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_order_from_best_to_worst() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn metadata_lookup() {
        let check = HealthCheck::degraded("query_bus", "queue 'read' is 90% full")
            .with_metadata("read_depth", "115")
            .with_metadata("read_capacity", "128");

        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.metadata_value("read_depth"), Some("115"));
        assert_eq!(check.metadata_value("missing"), None);
    }

    #[test]
    fn report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("query_bus"),
            HealthCheck::unhealthy("database", "connection refused"),
        ]);
        assert!(report.is_unhealthy());
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }
}
