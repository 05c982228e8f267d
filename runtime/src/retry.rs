//! Retry logic with exponential backoff for transient storage failures.
//!
//! Two layers use it:
//!
//! - [`RetryingEventStore`] / [`RetryingSnapshotStore`] wrap a store and retry
//!   only errors for which [`EventStoreError::is_transient`] holds. Conflicts
//!   are never retried here: they are domain decisions.
//! - Command handlers that know a command is safe to reapply (adding a trick
//!   to a dog) can reload-and-retry on `ConcurrencyConflict` with
//!   [`retry_with_predicate`].
//!
//! # Example
//!
//! ```rust
//! use rehydrate_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_secs(1))
//!     .build();
//!
//! let value = retry_with_backoff(&policy, || async { Ok::<_, String>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rehydrate_core::event::StoredEvent;
use rehydrate_core::event_store::{
    Commit, CommitAck, EventStore, EventStoreError, NotificationBatch, StoreFuture,
};
use rehydrate_core::snapshot::{Snapshot, SnapshotStore};
use rehydrate_core::stream::{AggregateId, Position, Version};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 50ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a random factor in `0.5..=1.0`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculate the delay before retry number `attempt` (0-indexed).
    ///
    /// `delay = min(initial_delay * multiplier^attempt, max_delay)`, scaled by
    /// a random factor when jitter is enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)]
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let scaled = if self.jitter {
            use rand::Rng;
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };

        Duration::from_secs_f64(scaled)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap for exponential backoff.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Retry an async operation on every error.
///
/// Returns the first success, or the last error once `max_retries` retries
/// have failed.
///
/// # Errors
///
/// Returns the operation's last error when retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation while `is_retryable` accepts the error.
///
/// # Example
///
/// ```rust
/// use rehydrate_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_predicate(
///     &RetryPolicy::default(),
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once retries
/// are exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    RetryMetrics::record_exhausted();
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Event store decorator that retries transient failures.
///
/// Reads are always retried. A `commit` is only retried when it carries
/// tracking: `Unavailable` does not say whether the first attempt landed, and
/// only a tracked commit turns a landed retry into a `TrackingConflict` the
/// follower reads as a redelivery. An untracked commit would come back as a
/// `ConcurrencyConflict` instead, and a caller that reloads and reapplies on
/// conflict would write its events twice, so its `Unavailable` is returned
/// as is.
pub struct RetryingEventStore<S> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S> RetryingEventStore<S> {
    /// Wrap a store.
    #[must_use]
    pub const fn new(inner: Arc<S>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

impl<S: EventStore + 'static> EventStore for RetryingEventStore<S> {
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitAck> {
        if commit.tracking.is_none() {
            return self.inner.commit(commit);
        }
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.commit(commit.clone()),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn read_stream(
        &self,
        reference: AggregateId,
        after: Version,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.read_stream(reference, after, limit),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn read_notifications(&self, after: Position, limit: usize) -> StoreFuture<'_, NotificationBatch> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.read_notifications(after, limit),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn max_position(&self) -> StoreFuture<'_, Position> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.max_position(),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn tracking_position(&self, follower: &str, upstream: &str) -> StoreFuture<'_, Position> {
        let follower = follower.to_string();
        let upstream = upstream.to_string();
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.tracking_position(&follower, &upstream),
                EventStoreError::is_transient,
            )
            .await
        })
    }
}

/// Snapshot store decorator that retries transient failures.
pub struct RetryingSnapshotStore<S> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S> RetryingSnapshotStore<S> {
    /// Wrap a store.
    #[must_use]
    pub const fn new(inner: Arc<S>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<S: SnapshotStore + 'static> SnapshotStore for RetryingSnapshotStore<S> {
    fn save_snapshot(&self, snapshot: Snapshot) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.save_snapshot(snapshot.clone()),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn load_latest(&self, reference: AggregateId) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.load_latest(reference),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn load_at_or_before(
        &self,
        reference: AggregateId,
        version: Version,
    ) -> StoreFuture<'_, Option<Snapshot>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.load_at_or_before(reference, version),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn delete_snapshots(&self, reference: AggregateId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                || self.inner.delete_snapshots(reference),
                EventStoreError::is_transient,
            )
            .await
        })
    }
}
