//! Prometheus metrics for observability and monitoring.
//!
//! Metrics are emitted through the `metrics` facade from every runtime
//! component:
//! - Event store commits and conflicts
//! - Repository replays and snapshots
//! - Follower batches, failures, poison notifications and redeliveries
//! - Retries of transient storage errors
//!
//! Installing a recorder is optional. Without [`MetricsServer::start`] every
//! recording call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use rehydrate_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

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

/// Prometheus metrics recorder.
///
/// Installs a global Prometheus recorder and exposes the rendered text for
/// scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for the given address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (several servers in one test binary) is not
    /// an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the metrics are published on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("event_store_commits_total", "Commits accepted by the event store");
    describe_counter!("event_store_events_committed_total", "Events written by accepted commits");
    describe_counter!(
        "event_store_conflicts_total",
        "Commits rejected by the optimistic concurrency check"
    );
    describe_histogram!("event_store_commit_duration_seconds", "Time taken to commit");

    describe_counter!(
        "repository_replayed_events_total",
        "Events folded while loading aggregates"
    );
    describe_counter!("repository_snapshots_taken_total", "Snapshots written");
    describe_counter!("repository_snapshot_failures_total", "Snapshot writes that failed");

    describe_counter!(
        "follower_notifications_processed_total",
        "Notifications committed by followers"
    );
    describe_histogram!(
        "follower_batch_duration_seconds",
        "Time taken by one fetch, apply and commit cycle"
    );
    describe_counter!("follower_policy_failures_total", "Batches aborted by a policy error");
    describe_counter!("follower_poisoned_total", "Notifications sent to the dead-letter sink");
    describe_counter!(
        "follower_redeliveries_total",
        "Batches found already committed by an earlier attempt"
    );
    describe_gauge!("follower_tracking_position", "Last committed tracking position");

    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retries");
}

/// Event store metrics recorder.
pub struct EventStoreMetrics;

impl EventStoreMetrics {
    /// Record an accepted commit.
    pub fn record_commit(events: usize, duration: Duration) {
        counter!("event_store_commits_total").increment(1);
        counter!("event_store_events_committed_total").increment(events as u64);
        histogram!("event_store_commit_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a commit rejected by the version check.
    pub fn record_conflict() {
        counter!("event_store_conflicts_total").increment(1);
    }
}

/// Repository metrics recorder.
pub struct RepositoryMetrics;

impl RepositoryMetrics {
    /// Record events folded by one load.
    pub fn record_replay(kind: &'static str, events: usize) {
        counter!("repository_replayed_events_total", "kind" => kind).increment(events as u64);
    }

    /// Record a snapshot written.
    pub fn record_snapshot(kind: &'static str) {
        counter!("repository_snapshots_taken_total", "kind" => kind).increment(1);
    }

    /// Record a snapshot write that failed.
    pub fn record_snapshot_failure(kind: &'static str) {
        counter!("repository_snapshot_failures_total", "kind" => kind).increment(1);
    }
}

/// Follower metrics recorder.
pub struct FollowerMetrics;

impl FollowerMetrics {
    /// Record a committed batch.
    pub fn record_batch(follower: &str, upstream: &str, notifications: usize, duration: Duration) {
        let labels = [
            ("follower", follower.to_string()),
            ("upstream", upstream.to_string()),
        ];
        counter!("follower_notifications_processed_total", &labels).increment(notifications as u64);
        histogram!("follower_batch_duration_seconds", &labels).record(duration.as_secs_f64());
    }

    /// Record the committed tracking position.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_position(follower: &str, upstream: &str, position: u64) {
        let labels = [
            ("follower", follower.to_string()),
            ("upstream", upstream.to_string()),
        ];
        gauge!("follower_tracking_position", &labels).set(position as f64);
    }

    /// Record a batch aborted by a policy error.
    pub fn record_policy_failure(follower: &str) {
        counter!("follower_policy_failures_total", "follower" => follower.to_string()).increment(1);
    }

    /// Record a poison notification.
    pub fn record_poisoned(follower: &str) {
        counter!("follower_poisoned_total", "follower" => follower.to_string()).increment(1);
    }

    /// Record a redelivered batch.
    pub fn record_redelivery(follower: &str) {
        counter!("follower_redeliveries_total", "follower" => follower.to_string()).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
