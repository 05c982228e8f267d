//! Health reporting for a running system.
//!
//! A follower is healthy while it runs with every upstream flowing, degraded
//! while an upstream is stalled on a poison notification, and unhealthy once
//! it has stopped without being asked to.

use crate::coordinator::{FollowerHandle, FollowerState, UpstreamStatus};
use rehydrate_core::{DateTime, Utc};
use std::fmt;

/// Health level of a component or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Running, but some work is held back.
    Degraded,
    /// Not running.
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
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

/// Health of one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Follower name.
    pub component: String,
    /// Derived status.
    pub status: HealthStatus,
    /// Why the status is not healthy.
    pub message: Option<String>,
    /// Lifecycle state and per-upstream details.
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Inspect a follower through its handle.
    ///
    /// `stop_requested` tells a deliberate stop apart from a halt.
    #[must_use]
    pub fn follower(handle: &FollowerHandle, stop_requested: bool) -> Self {
        let state = handle.state();
        let mut statuses: Vec<_> = handle.statuses().into_iter().collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metadata = vec![("state".to_string(), state.to_string())];
        let mut stalled = Vec::new();
        for (upstream, status) in statuses {
            let value = match status {
                UpstreamStatus::Running => "running".to_string(),
                UpstreamStatus::Stalled { position } => {
                    stalled.push(format!("{upstream} at {position}"));
                    format!("stalled at {position}")
                }
            };
            metadata.push((format!("upstream.{upstream}"), value));
        }

        let halted = matches!(state, FollowerState::Stopped | FollowerState::Stopping) && !stop_requested;
        let (status, message) = if halted {
            (HealthStatus::Unhealthy, Some(format!("follower is {state}")))
        } else if stalled.is_empty() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Degraded,
                Some(format!("stalled on poison notification: {}", stalled.join(", "))),
            )
        };

        Self {
            component: handle.name().to_string(),
            status,
            message,
            metadata,
        }
    }
}

/// Health of every follower in a system.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status of all checks.
    pub status: HealthStatus,
    /// One check per follower.
    pub checks: Vec<HealthCheck>,
    /// When the report was taken.
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Combine checks into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Whether every follower is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// The check of one follower.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}
