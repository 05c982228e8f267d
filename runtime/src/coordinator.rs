//! `ProcessCoordinator`: a follower of one or more upstream applications.
//!
//! # Overview
//!
//! A coordinator reads the notification sequence of each upstream it
//! follows, hands every notification to its [`Policy`], and commits the
//! resulting downstream events together with its tracking position:
//!
//! ```text
//! ┌──────────┐  notifications  ┌──────────────────┐  commit(events + tracking)  ┌────────────┐
//! │ upstream │ ──────────────▶ │ ProcessCoordinator│ ─────────────────────────▶ │ downstream │
//! └──────────┘                 └──────────────────┘                             └────────────┘
//! ```
//!
//! Each (follower, upstream) pair cycles through
//! `Idle → Fetching → Applying → Committing → Idle` until stopped.
//!
//! # Delivery
//!
//! Tracking records live in the downstream event store and advance in the
//! same commit as the downstream events, so a crash can never leave one
//! without the other. If a batch is delivered twice, the second commit's
//! tracking update is not ahead of the stored one and the store rejects the
//! whole commit with `TrackingConflict`; the coordinator counts it as a
//! redelivery and moves on.
//!
//! # Failures
//!
//! - `ConcurrencyConflict` on a downstream aggregate: the batch is dropped
//!   and processed again on the next cycle
//! - policy error: the batch is dropped, [`FollowerAlert::PolicyFailed`] is
//!   broadcast and the failing notification's attempt count grows. The
//!   upstream waits `store_retry.delay_for_attempt(attempts)` before the next
//!   try. At `max_attempts` the notification is recorded in the dead-letter
//!   sink and the upstream stalls until an operator calls
//!   [`FollowerHandle::skip`] or [`FollowerHandle::retry`]. Other upstreams
//!   keep running.
//! - storage unavailable inside a policy: not the notification's fault, so it
//!   never counts towards `max_attempts`. The upstream backs off under
//!   `store_retry`; once its retries are used up the cycle fails with
//!   [`FollowerError::Storage`].
//! - unknown event type: fatal, the follower stops and [`ProcessCoordinator::run`]
//!   returns the error
//!
//! # Example
//!
//! ```ignore
//! let (mut counters, handle) = ProcessCoordinator::new(
//!     "counters",
//!     counters_app,
//!     Arc::new(CountersPolicy),
//!     FollowerConfig::default(),
//! );
//! counters.follow(dog_school_app);
//!
//! let task = counters.spawn();
//! // ...
//! handle.stop();
//! task.await??;
//! ```

use crate::application::Application;
use crate::metrics::FollowerMetrics;
use crate::processing::{Policy, PolicyError, ProcessingUnit};
use crate::retry::{RetryPolicy, retry_with_predicate};
use rehydrate_core::dead_letter::{DeadLetterSink, FailedNotification};
use rehydrate_core::event::StoredEvent;
use rehydrate_core::event_store::{Commit, CommitAck, EventStoreError, NotificationBatch, Tracking};
use rehydrate_core::stream::Position;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as Deadline;

/// Errors that end or refuse follower operations.
#[derive(Error, Debug)]
pub enum FollowerError {
    /// A notification carries an event type nobody registered, or a payload
    /// schema newer than this deployment.
    #[error("Follower {follower} cannot read notification {position} from {upstream}: {source}")]
    UnknownEventType {
        /// Follower name.
        follower: String,
        /// Upstream name.
        upstream: String,
        /// Position of the unreadable notification.
        position: Position,
        /// Underlying error.
        source: PolicyError,
    },

    /// Storage failed after retries.
    #[error("Storage error in follower {follower}: {source}")]
    Storage {
        /// Follower name.
        follower: String,
        /// Underlying error.
        source: EventStoreError,
    },

    /// The named upstream is not followed.
    #[error("Follower {follower} does not follow {upstream}")]
    UnknownUpstream {
        /// Follower name.
        follower: String,
        /// Upstream name.
        upstream: String,
    },

    /// Skip was requested for an upstream that is not stalled at that position.
    #[error("Upstream {upstream} is not stalled at {position}")]
    NotStalled {
        /// Upstream name.
        upstream: String,
        /// Position given by the operator.
        position: Position,
    },

    /// The coordinator is gone.
    #[error("Follower {0} is no longer running")]
    Closed(String),
}

impl FollowerError {
    /// Whether the follower has to stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownEventType { .. })
    }
}

/// Follower configuration.
///
/// # Default Values
///
/// - `batch_size`: 100 notifications per cycle
/// - `poll_interval`: 100ms
/// - `max_attempts`: 3 failures before a notification is poison
/// - `store_retry`: [`RetryPolicy::default`] for transient storage errors,
///   also the backoff between policy retries
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Notifications read per cycle.
    pub batch_size: usize,
    /// How long to wait for new notifications when idle.
    pub poll_interval: Duration,
    /// Failures of one notification before it is treated as poison.
    pub max_attempts: u32,
    /// Retry policy for transient storage errors.
    pub store_retry: RetryPolicy,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FollowerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> FollowerConfigBuilder {
        FollowerConfigBuilder {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_attempts: 3,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Builder for [`FollowerConfig`].
#[derive(Debug, Clone)]
pub struct FollowerConfigBuilder {
    batch_size: usize,
    poll_interval: Duration,
    max_attempts: u32,
    store_retry: RetryPolicy,
}

impl FollowerConfigBuilder {
    /// Set notifications read per cycle (at least 1).
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set failures before a notification is poison (at least 1).
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the retry policy for transient storage errors.
    #[must_use]
    pub fn store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    /// Build the [`FollowerConfig`].
    #[must_use]
    pub fn build(self) -> FollowerConfig {
        FollowerConfig {
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            max_attempts: self.max_attempts,
            store_retry: self.store_retry,
        }
    }
}

/// Lifecycle state of a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    /// Waiting for notifications.
    Idle,
    /// Reading notifications.
    Fetching,
    /// Running the policy.
    Applying,
    /// Writing downstream events and tracking.
    Committing,
    /// Stop requested, finishing the current cycle.
    Stopping,
    /// Stopped. A new coordinator with the same name resumes from tracking.
    Stopped,
}

impl fmt::Display for FollowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Applying => "applying",
            Self::Committing => "committing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Processing status of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    /// Notifications are being processed.
    Running,
    /// Halted on a poison notification.
    Stalled {
        /// Position of the poison notification.
        position: Position,
    },
}

/// Operator notifications broadcast by a follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowerAlert {
    /// A policy failed; the batch will be retried.
    PolicyFailed {
        /// Follower name.
        follower: String,
        /// Upstream name.
        upstream: String,
        /// Failing notification.
        position: Position,
        /// Failures so far for this notification.
        attempts: u32,
        /// Error message.
        error: String,
    },
    /// A notification failed too often; the upstream is stalled.
    Poisoned {
        /// Follower name.
        follower: String,
        /// Upstream name.
        upstream: String,
        /// Poison notification.
        position: Position,
        /// Its event type.
        event_type: String,
        /// Last error message.
        error: String,
    },
    /// The follower stopped on a fatal error.
    Halted {
        /// Follower name.
        follower: String,
        /// Error message.
        error: String,
    },
}

/// Result of one fetch, apply and commit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new notifications.
    Idle,
    /// Notifications committed.
    Committed {
        /// Number of notifications.
        notifications: usize,
        /// New tracking position.
        position: Position,
    },
    /// The batch had already been committed.
    Redelivered,
    /// A downstream aggregate moved on; the batch will be retried.
    Conflict,
    /// The policy failed; the batch will be retried.
    PolicyFailed {
        /// Failing notification.
        position: Position,
    },
    /// The upstream is waiting before its next try.
    Backoff {
        /// When the upstream runs again.
        until: Deadline,
    },
    /// The upstream is stalled on a poison notification.
    Stalled {
        /// Poison notification.
        position: Position,
    },
}

impl CycleOutcome {
    const fn made_progress(self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Redelivered | Self::Conflict)
    }
}

enum Command {
    Skip { upstream: String, position: Position },
    Retry { upstream: String },
}

struct Upstream {
    app: Application,
    wakeup: watch::Receiver<Position>,
    status: UpstreamStatus,
    failure: Option<(Position, u32)>,
    unavailable: u32,
    backoff: Option<Deadline>,
    clip: Option<usize>,
}

/// Follows upstream applications and commits a policy's effects downstream.
pub struct ProcessCoordinator {
    name: String,
    downstream: Application,
    policy: Arc<dyn Policy>,
    config: FollowerConfig,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    upstreams: Vec<Upstream>,
    state: Arc<watch::Sender<FollowerState>>,
    statuses: Arc<watch::Sender<BTreeMap<String, UpstreamStatus>>>,
    alerts: broadcast::Sender<FollowerAlert>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ProcessCoordinator {
    /// Create a coordinator writing into `downstream`.
    ///
    /// Returns the coordinator and a handle for operators. Upstreams are
    /// added with [`ProcessCoordinator::follow`].
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        downstream: Application,
        policy: Arc<dyn Policy>,
        config: FollowerConfig,
    ) -> (Self, FollowerHandle) {
        let (state, _) = watch::channel(FollowerState::Idle);
        let (statuses, _) = watch::channel(BTreeMap::new());
        let (alerts, _) = broadcast::channel(64);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let coordinator = Self {
            name: name.into(),
            downstream,
            policy,
            config,
            dead_letters: None,
            upstreams: Vec::new(),
            state: Arc::new(state),
            statuses: Arc::new(statuses),
            alerts,
            commands,
            command_tx,
            shutdown,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        let handle = coordinator.handle();
        (coordinator, handle)
    }

    /// Follow an upstream application.
    ///
    /// Following the same application twice has no effect.
    pub fn follow(&mut self, upstream: Application) -> &mut Self {
        if self.upstreams.iter().any(|u| u.app.name() == upstream.name()) {
            return self;
        }
        self.statuses.send_modify(|s| {
            s.insert(upstream.name().to_string(), UpstreamStatus::Running);
        });
        self.upstreams.push(Upstream {
            wakeup: upstream.subscribe(),
            app: upstream,
            status: UpstreamStatus::Running,
            failure: None,
            unavailable: 0,
            backoff: None,
            clip: None,
        });
        self
    }

    /// Record poison notifications in a dead-letter sink.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Follower name, used in tracking records.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the followed upstreams, in follow order.
    #[must_use]
    pub fn upstreams(&self) -> Vec<&str> {
        self.upstreams.iter().map(|u| u.app.name()).collect()
    }

    /// A new handle to this coordinator.
    #[must_use]
    pub fn handle(&self) -> FollowerHandle {
        FollowerHandle {
            name: self.name.clone(),
            state: self.state.subscribe(),
            statuses: self.statuses.subscribe(),
            alerts: self.alerts.clone(),
            commands: self.command_tx.clone(),
            shutdown: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run one cycle for the named upstream.
    ///
    /// # Errors
    ///
    /// - [`FollowerError::UnknownEventType`]: fatal, the follower must stop
    /// - [`FollowerError::Storage`]: storage failed after retries
    /// - [`FollowerError::UnknownUpstream`]: the name is not followed
    pub async fn process_next(&mut self, upstream: &str) -> Result<CycleOutcome, FollowerError> {
        let index = self.index_of(upstream)?;
        let outcome = self.cycle(index).await;
        self.set_state(FollowerState::Idle);
        outcome
    }

    /// Process every upstream until none has anything left to do.
    ///
    /// Pending operator commands are applied first. An upstream backing off
    /// after a failure is waited for. Returns the number of notifications
    /// committed.
    ///
    /// # Errors
    ///
    /// As [`ProcessCoordinator::process_next`].
    pub async fn run_until_idle(&mut self) -> Result<usize, FollowerError> {
        self.drain_commands().await;
        let mut committed = 0;
        loop {
            let (count, progressed) = self.run_pass().await?;
            committed += count;
            if progressed {
                continue;
            }
            match self.next_retry() {
                Some(at) => tokio::time::sleep_until(at).await,
                None => {
                    self.set_state(FollowerState::Idle);
                    return Ok(committed);
                }
            }
        }
    }

    /// Skip a poison notification by committing tracking past it.
    ///
    /// # Errors
    ///
    /// - [`FollowerError::NotStalled`] if the upstream is not stalled at `position`
    /// - [`FollowerError::Storage`] if the tracking commit fails
    pub async fn skip(&mut self, upstream: &str, position: Position) -> Result<(), FollowerError> {
        let index = self.index_of(upstream)?;
        if self.upstreams[index].status != (UpstreamStatus::Stalled { position }) {
            return Err(FollowerError::NotStalled {
                upstream: upstream.to_string(),
                position,
            });
        }

        let tracking = Tracking::new(self.name.clone(), upstream, position);
        match self.downstream.commit(Commit::tracking_only(tracking)).await {
            Ok(_) | Err(EventStoreError::TrackingConflict { .. }) => {}
            Err(source) => {
                return Err(FollowerError::Storage {
                    follower: self.name.clone(),
                    source,
                });
            }
        }

        tracing::warn!(
            follower = %self.name,
            upstream,
            position = %position,
            "Poison notification skipped by operator"
        );
        self.resume(index);
        Ok(())
    }

    /// Clear a stall and process the poison notification again.
    ///
    /// # Errors
    ///
    /// [`FollowerError::UnknownUpstream`] if the name is not followed.
    pub fn retry(&mut self, upstream: &str) -> Result<(), FollowerError> {
        let index = self.index_of(upstream)?;
        tracing::info!(follower = %self.name, upstream, "Retry requested by operator");
        self.resume(index);
        Ok(())
    }

    /// Run until stopped through a [`FollowerHandle`].
    ///
    /// The loop processes every upstream, then waits for the poll interval, a
    /// commit in an upstream, an operator command, or the stop signal. A stop
    /// lets the current cycle finish, commit included.
    ///
    /// # Errors
    ///
    /// Returns [`FollowerError::UnknownEventType`] if the follower halted on a
    /// fatal error. Storage errors are logged and retried on the next cycle.
    pub async fn run(mut self) -> Result<(), FollowerError> {
        tracing::info!(
            follower = %self.name,
            downstream = self.downstream.name(),
            upstreams = ?self.upstreams(),
            "Starting follower"
        );

        while !*self.shutdown.borrow() {
            self.drain_commands().await;

            let progressed = match self.run_pass().await {
                Ok((_, progressed)) => progressed,
                Err(e) if e.is_fatal() => {
                    tracing::error!(follower = %self.name, error = %e, "Follower halted");
                    let _ = self.alerts.send(FollowerAlert::Halted {
                        follower: self.name.clone(),
                        error: e.to_string(),
                    });
                    self.set_state(FollowerState::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(follower = %self.name, error = %e, "Follower cycle failed");
                    false
                }
            };
            if progressed {
                continue;
            }

            self.set_state(FollowerState::Idle);
            let wait = self.next_retry().map_or(self.config.poll_interval, |at| {
                at.saturating_duration_since(Deadline::now())
                    .min(self.config.poll_interval)
            });
            let command = {
                let poll = tokio::time::sleep(wait);
                let mut wakeups: Vec<_> = self.upstreams.iter_mut().map(|u| &mut u.wakeup).collect();
                tokio::select! {
                    () = poll => None,
                    () = upstream_changed(&mut wakeups) => None,
                    command = self.commands.recv() => command,
                    _ = self.shutdown.changed() => None,
                }
            };
            if let Some(command) = command {
                self.apply_command(command).await;
            }
        }

        self.set_state(FollowerState::Stopping);
        tracing::info!(follower = %self.name, "Follower stopped");
        self.set_state(FollowerState::Stopped);
        Ok(())
    }

    /// Run on a new tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<(), FollowerError>> {
        tokio::spawn(self.run())
    }

    fn index_of(&self, upstream: &str) -> Result<usize, FollowerError> {
        self.upstreams
            .iter()
            .position(|u| u.app.name() == upstream)
            .ok_or_else(|| FollowerError::UnknownUpstream {
                follower: self.name.clone(),
                upstream: upstream.to_string(),
            })
    }

    fn next_retry(&self) -> Option<Deadline> {
        self.upstreams
            .iter()
            .filter(|u| u.status == UpstreamStatus::Running)
            .filter_map(|u| u.backoff)
            .min()
    }

    async fn run_pass(&mut self) -> Result<(usize, bool), FollowerError> {
        let mut committed = 0;
        let mut progressed = false;
        for index in 0..self.upstreams.len() {
            if *self.shutdown.borrow() {
                break;
            }
            let outcome = self.cycle(index).await?;
            if let CycleOutcome::Committed { notifications, .. } = outcome {
                committed += notifications;
            }
            progressed |= outcome.made_progress();
        }
        Ok((committed, progressed))
    }

    async fn cycle(&mut self, index: usize) -> Result<CycleOutcome, FollowerError> {
        if let UpstreamStatus::Stalled { position } = self.upstreams[index].status {
            return Ok(CycleOutcome::Stalled { position });
        }
        if let Some(until) = self.upstreams[index].backoff {
            if until > Deadline::now() {
                return Ok(CycleOutcome::Backoff { until });
            }
            self.upstreams[index].backoff = None;
        }
        let upstream = self.upstreams[index].app.clone();
        let started = Instant::now();

        self.set_state(FollowerState::Fetching);
        let position = self.load_tracking(upstream.name()).await?;
        let limit = self.upstreams[index].clip.take().unwrap_or(self.config.batch_size);
        let batch = self.fetch(&upstream, position, limit).await?;
        if batch.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        tracing::debug!(
            follower = %self.name,
            upstream = upstream.name(),
            after = %position,
            notifications = batch.events.len(),
            "Batch fetched"
        );

        self.set_state(FollowerState::Applying);
        let mut unit = ProcessingUnit::new(self.downstream.clone());
        for (offset, event) in batch.events.iter().enumerate() {
            if let Err(error) = self.apply(&upstream, event, &mut unit).await {
                if error.is_fatal() {
                    return Err(FollowerError::UnknownEventType {
                        follower: self.name.clone(),
                        upstream: upstream.name().to_string(),
                        position: event.position,
                        source: error,
                    });
                }
                if let Some(source) = error.transient_storage() {
                    return self.storage_unavailable(index, event, source.clone());
                }
                return Ok(self.policy_failed(index, offset, event, &error).await);
            }
        }
        self.upstreams[index].unavailable = 0;

        self.set_state(FollowerState::Committing);
        let notifications = batch.events.len();
        let tracking = Tracking::new(self.name.clone(), upstream.name(), batch.next_position);
        let commit = unit.take_commit(tracking);
        // A retried commit that had in fact landed is rejected on tracking and
        // counted as a redelivery below.
        let result = retry_with_predicate(
            &self.config.store_retry,
            || self.downstream.commit(commit.clone()),
            EventStoreError::is_transient,
        )
        .await;
        if let Ok(ack) = &result {
            unit.snapshot_committed(ack).await;
        }

        self.committed(index, &upstream, notifications, batch.next_position, started, result)
    }

    async fn apply(
        &self,
        upstream: &Application,
        event: &StoredEvent,
        unit: &mut ProcessingUnit,
    ) -> Result<(), PolicyError> {
        upstream
            .registry()
            .check(&event.kind, &event.event_type)
            .map_err(|e| PolicyError::Repository(e.into()))?;
        self.policy.process(upstream.name(), event, unit).await
    }

    fn committed(
        &mut self,
        index: usize,
        upstream: &Application,
        notifications: usize,
        position: Position,
        started: Instant,
        result: Result<CommitAck, EventStoreError>,
    ) -> Result<CycleOutcome, FollowerError> {
        match result {
            Ok(ack) => {
                if matches!(self.upstreams[index].failure, Some((failed, _)) if failed <= position) {
                    self.upstreams[index].failure = None;
                }
                FollowerMetrics::record_batch(&self.name, upstream.name(), notifications, started.elapsed());
                FollowerMetrics::record_position(&self.name, upstream.name(), position.value());
                tracing::debug!(
                    follower = %self.name,
                    upstream = upstream.name(),
                    notifications,
                    tracking = %position,
                    downstream_events = ack.versions.len(),
                    "Batch committed"
                );
                Ok(CycleOutcome::Committed {
                    notifications,
                    position,
                })
            }
            Err(EventStoreError::TrackingConflict { stored, attempted, .. }) => {
                FollowerMetrics::record_redelivery(&self.name);
                tracing::warn!(
                    follower = %self.name,
                    upstream = upstream.name(),
                    stored = %stored,
                    attempted = %attempted,
                    "Batch already committed, discarding redelivery"
                );
                Ok(CycleOutcome::Redelivered)
            }
            Err(EventStoreError::ConcurrencyConflict { reference, .. }) => {
                tracing::warn!(
                    follower = %self.name,
                    upstream = upstream.name(),
                    reference = %reference,
                    "Downstream aggregate moved on, batch will be retried"
                );
                Ok(CycleOutcome::Conflict)
            }
            Err(source) => Err(FollowerError::Storage {
                follower: self.name.clone(),
                source,
            }),
        }
    }

    async fn policy_failed(
        &mut self,
        index: usize,
        offset: usize,
        event: &StoredEvent,
        error: &PolicyError,
    ) -> CycleOutcome {
        let upstream_name = self.upstreams[index].app.name().to_string();
        let attempts = match self.upstreams[index].failure {
            Some((position, attempts)) if position == event.position => attempts + 1,
            _ => 1,
        };
        self.upstreams[index].failure = Some((event.position, attempts));

        FollowerMetrics::record_policy_failure(&self.name);
        tracing::error!(
            follower = %self.name,
            upstream = %upstream_name,
            position = %event.position,
            event_type = %event.event_type,
            attempts,
            error = %error,
            "Policy failed, batch aborted"
        );
        let _ = self.alerts.send(FollowerAlert::PolicyFailed {
            follower: self.name.clone(),
            upstream: upstream_name.clone(),
            position: event.position,
            attempts,
            error: error.to_string(),
        });

        // Notifications ahead of the failing one still have to commit before
        // it can be skipped, so the next batch stops right before it.
        if offset > 0 {
            self.upstreams[index].clip = Some(offset);
            self.upstreams[index].backoff = Some(Deadline::now());
            return CycleOutcome::PolicyFailed {
                position: event.position,
            };
        }
        if attempts < self.config.max_attempts {
            let delay = self.config.store_retry.delay_for_attempt(attempts - 1);
            self.upstreams[index].backoff = Some(Deadline::now() + delay);
            return CycleOutcome::PolicyFailed {
                position: event.position,
            };
        }

        self.poison(index, event, error, attempts).await;
        CycleOutcome::Stalled {
            position: event.position,
        }
    }

    fn storage_unavailable(
        &mut self,
        index: usize,
        event: &StoredEvent,
        source: EventStoreError,
    ) -> Result<CycleOutcome, FollowerError> {
        let retry = &self.config.store_retry;
        let upstream = &mut self.upstreams[index];
        if upstream.unavailable >= retry.max_retries {
            upstream.unavailable = 0;
            return Err(FollowerError::Storage {
                follower: self.name.clone(),
                source,
            });
        }

        let until = Deadline::now() + retry.delay_for_attempt(upstream.unavailable);
        upstream.unavailable += 1;
        upstream.backoff = Some(until);
        tracing::warn!(
            follower = %self.name,
            upstream = upstream.app.name(),
            position = %event.position,
            retries = upstream.unavailable,
            error = %source,
            "Storage unavailable while applying, backing off"
        );
        Ok(CycleOutcome::Backoff { until })
    }

    async fn poison(&mut self, index: usize, event: &StoredEvent, error: &PolicyError, attempts: u32) {
        let upstream_name = self.upstreams[index].app.name().to_string();
        FollowerMetrics::record_poisoned(&self.name);
        tracing::error!(
            follower = %self.name,
            upstream = %upstream_name,
            position = %event.position,
            event_type = %event.event_type,
            "Poison notification, upstream stalled until skipped or retried"
        );

        if let Some(sink) = &self.dead_letters {
            let failed = FailedNotification::new(
                self.name.clone(),
                upstream_name.clone(),
                event,
                error.to_string(),
                attempts,
                self.downstream.clock().now(),
            );
            if let Err(e) = sink.record(failed).await {
                tracing::error!(
                    follower = %self.name,
                    upstream = %upstream_name,
                    position = %event.position,
                    error = %e,
                    "Failed to record poison notification"
                );
            }
        }

        let _ = self.alerts.send(FollowerAlert::Poisoned {
            follower: self.name.clone(),
            upstream: upstream_name,
            position: event.position,
            event_type: event.event_type.clone(),
            error: error.to_string(),
        });
        self.set_status(
            index,
            UpstreamStatus::Stalled {
                position: event.position,
            },
        );
    }

    fn resume(&mut self, index: usize) {
        self.upstreams[index].failure = None;
        self.upstreams[index].unavailable = 0;
        self.upstreams[index].backoff = None;
        self.upstreams[index].clip = None;
        self.set_status(index, UpstreamStatus::Running);
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command).await;
        }
    }

    async fn apply_command(&mut self, command: Command) {
        let result = match command {
            Command::Skip { upstream, position } => self.skip(&upstream, position).await,
            Command::Retry { upstream } => self.retry(&upstream),
        };
        if let Err(e) = result {
            tracing::warn!(follower = %self.name, error = %e, "Operator command rejected");
        }
    }

    async fn load_tracking(&self, upstream: &str) -> Result<Position, FollowerError> {
        retry_with_predicate(
            &self.config.store_retry,
            || self.downstream.events().tracking_position(&self.name, upstream),
            EventStoreError::is_transient,
        )
        .await
        .map_err(|source| FollowerError::Storage {
            follower: self.name.clone(),
            source,
        })
    }

    async fn fetch(
        &self,
        upstream: &Application,
        after: Position,
        limit: usize,
    ) -> Result<NotificationBatch, FollowerError> {
        retry_with_predicate(
            &self.config.store_retry,
            || upstream.events().read_notifications(after, limit),
            EventStoreError::is_transient,
        )
        .await
        .map_err(|source| FollowerError::Storage {
            follower: self.name.clone(),
            source,
        })
    }

    fn set_state(&self, state: FollowerState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn set_status(&mut self, index: usize, status: UpstreamStatus) {
        self.upstreams[index].status = status;
        let name = self.upstreams[index].app.name().to_string();
        self.statuses.send_modify(|s| {
            s.insert(name, status);
        });
    }
}

async fn upstream_changed(receivers: &mut [&mut watch::Receiver<Position>]) {
    if receivers.is_empty() {
        return std::future::pending().await;
    }
    let changes = receivers.iter_mut().map(|r| Box::pin(r.changed()));
    let _ = futures::future::select_all(changes).await;
}

/// Operator handle to a running or idle coordinator.
#[derive(Clone)]
pub struct FollowerHandle {
    name: String,
    state: watch::Receiver<FollowerState>,
    statuses: watch::Receiver<BTreeMap<String, UpstreamStatus>>,
    alerts: broadcast::Sender<FollowerAlert>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl FollowerHandle {
    /// Follower name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FollowerState {
        *self.state.borrow()
    }

    /// Receiver of lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<FollowerState> {
        self.state.clone()
    }

    /// Status of one upstream.
    #[must_use]
    pub fn status(&self, upstream: &str) -> Option<UpstreamStatus> {
        self.statuses.borrow().get(upstream).copied()
    }

    /// Status of every upstream.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, UpstreamStatus> {
        self.statuses
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Subscribe to operator alerts.
    #[must_use]
    pub fn alerts(&self) -> broadcast::Receiver<FollowerAlert> {
        self.alerts.subscribe()
    }

    /// Ask the coordinator to skip the poison notification at `position`.
    ///
    /// The request is applied before the coordinator's next cycle.
    ///
    /// # Errors
    ///
    /// [`FollowerError::Closed`] if the coordinator was dropped.
    pub fn skip(&self, upstream: &str, position: Position) -> Result<(), FollowerError> {
        self.commands
            .send(Command::Skip {
                upstream: upstream.to_string(),
                position,
            })
            .map_err(|_| FollowerError::Closed(self.name.clone()))
    }

    /// Ask the coordinator to process a stalled upstream again.
    ///
    /// # Errors
    ///
    /// [`FollowerError::Closed`] if the coordinator was dropped.
    pub fn retry(&self, upstream: &str) -> Result<(), FollowerError> {
        self.commands
            .send(Command::Retry {
                upstream: upstream.to_string(),
            })
            .map_err(|_| FollowerError::Closed(self.name.clone()))
    }

    /// Ask the coordinator to stop after its current cycle.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the coordinator reports [`FollowerState::Stopped`].
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == FollowerState::Stopped).await;
    }
}

impl fmt::Debug for FollowerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowerHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
