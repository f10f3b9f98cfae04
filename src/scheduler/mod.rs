//! Background scheduler for engine-driven transitions.
//!
//! Two jobs share one loop:
//!
//! - **Timers.** Delayed transitions registered by the engine sit in a [`DelayedQueue`]. When
//!   one comes due it is not applied blindly: the request is reloaded, the stage is checked
//!   against the edge's `from` (stale timers are skipped), and the conditions are re-gated.
//!   A blocked timer is re-armed and tried again later.
//! - **Sweep.** Every `sweep_interval_ms` the scheduler pages through live requests and tries
//!   the automatic transitions out of each one's current stage, picking up conditions that
//!   became true in the meantime (a neighbor signing off, a board member voting).
//!
//! Requests that already have a transition in flight are skipped, never waited on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod queue;

pub use queue::{DelayedQueue, ScheduledTransition};

use crate::conditions::Evaluation;
use crate::domain::request::{Actor, RequestId, Stage};
use crate::domain::rule::{Transition, TransitionId};
use crate::engine::WorkflowEngine;
use crate::error::{Result, WorkflowError};
use crate::manager::RequestStore;

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often to sweep live requests for ready automatic transitions.
    pub sweep_interval_ms: u64,

    /// How often to check the delayed queue for due timers.
    pub timer_poll_interval_ms: u64,

    /// Delay before re-checking a delayed transition whose conditions failed when it fired.
    pub blocked_recheck_ms: u64,

    /// Requests loaded per page during a sweep.
    pub sweep_batch_size: usize,

    /// Interval for logging scheduler status. None disables it.
    pub status_log_interval_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            timer_poll_interval_ms: 1_000,
            blocked_recheck_ms: 60_000,
            sweep_batch_size: 500,
            status_log_interval_ms: Some(60_000),
        }
    }
}

/// What happened when a timer fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The transition was applied; the request is now in `to`.
    Applied { to: Stage },
    /// The request had already left the timer's `from` stage, or the catalog has no delayed
    /// edge by that id.
    Stale { current: Stage },
    /// Conditions failed; the timer was re-armed.
    Blocked { reason: String, retry_at: DateTime<Utc> },
    /// The request no longer exists.
    Missing,
    /// Another transition held the lease; the timer was re-armed for the next poll.
    InFlight,
}

/// Result of one [`Scheduler::tick`].
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub fired: Vec<(ScheduledTransition, FireOutcome)>,
    pub advanced: usize,
}

/// Counters readable while the scheduler runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub sweeps: u64,
    pub timers_fired: u64,
    pub transitions_applied: u64,
    pub stale_skipped: u64,
    pub blocked_rechecks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sweeps: AtomicU64,
    timers_fired: AtomicU64,
    transitions_applied: AtomicU64,
    stale_skipped: AtomicU64,
    blocked_rechecks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            blocked_rechecks: self.blocked_rechecks.load(Ordering::Relaxed),
        }
    }
}

/// Drives delayed and automatic transitions for a [`WorkflowEngine`].
pub struct Scheduler<S: RequestStore> {
    engine: Arc<WorkflowEngine<S>>,
    config: SchedulerConfig,
    counters: Arc<Counters>,
    shutdown_token: CancellationToken,
}

impl<S: RequestStore + 'static> Scheduler<S> {
    pub fn new(
        engine: Arc<WorkflowEngine<S>>,
        config: SchedulerConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            counters: Arc::new(Counters::default()),
            shutdown_token,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<S>> {
        &self.engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Register `transition` to be re-checked and applied `delay` from now.
    pub fn schedule_delayed(&self, request_id: RequestId, transition: &Transition, delay: Duration) {
        self.schedule_at(request_id, transition, queue::due_after(Utc::now(), delay));
    }

    /// Register `transition` to be re-checked and applied at `due_at`.
    pub fn schedule_at(&self, request_id: RequestId, transition: &Transition, due_at: DateTime<Utc>) {
        self.engine
            .timers()
            .schedule(ScheduledTransition::new(request_id, transition, due_at));
    }

    /// Cancel a pending delayed transition. Returns true if one was pending.
    pub fn cancel(&self, request_id: RequestId, transition_id: &TransitionId) -> bool {
        let cancelled = self.engine.timers().cancel(request_id, transition_id);
        if cancelled {
            tracing::debug!(
                request_id = %request_id,
                transition_id = %transition_id,
                "Cancelled delayed transition"
            );
        }
        cancelled
    }

    /// Fire every timer due at `now`, then run one sweep.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let fired = self.fire_due(now).await;
        let advanced = self.sweep().await?;
        Ok(TickReport { fired, advanced })
    }

    /// Fire every timer due at `now`.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<(ScheduledTransition, FireOutcome)> {
        let due = self.engine.timers().take_due(now);
        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            let outcome = self.fire(&entry, now).await;
            fired.push((entry, outcome));
        }
        fired
    }

    /// Re-check and apply one delayed transition. The entry has already been taken off the
    /// queue; it is put back only when blocked or in flight.
    #[tracing::instrument(skip(self, entry), fields(request_id = %entry.request_id, transition_id = %entry.transition_id))]
    pub async fn fire(&self, entry: &ScheduledTransition, now: DateTime<Utc>) -> FireOutcome {
        self.counters.timers_fired.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.try_fire(entry, now).await {
            Ok(outcome) => outcome,
            Err(WorkflowError::TransitionInProgress(_)) => FireOutcome::InFlight,
            Err(WorkflowError::RequestNotFound(_)) => FireOutcome::Missing,
            Err(e) => {
                // Storage or catalog failure: keep the timer and try again after the recheck delay.
                let retry_at = queue::due_after(now, Duration::from_millis(self.config.blocked_recheck_ms));
                tracing::error!(error = %e, retry_at = %retry_at, "Delayed transition failed");
                self.engine.timers().schedule(entry.clone().rearm(retry_at));
                return FireOutcome::Blocked {
                    reason: e.to_string(),
                    retry_at,
                };
            }
        };

        match &outcome {
            FireOutcome::Applied { to } => {
                self.counters.transitions_applied.fetch_add(1, Ordering::Relaxed);
                tracing::info!(to = %to, "Delayed transition applied");
            }
            FireOutcome::Stale { current } => {
                self.counters.stale_skipped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("covenant_stale_timers_skipped_total").increment(1);
                tracing::warn!(
                    expected = %entry.from,
                    current = %current,
                    "Skipping stale delayed transition"
                );
            }
            FireOutcome::Blocked { reason, retry_at } => {
                self.counters.blocked_rechecks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(reason = %reason, retry_at = %retry_at, "Delayed transition blocked by conditions");
                self.engine.timers().schedule(entry.clone().rearm(*retry_at));
            }
            FireOutcome::InFlight => {
                tracing::debug!("Request busy, re-arming delayed transition");
                self.engine.timers().schedule(entry.clone().rearm(now));
            }
            FireOutcome::Missing => {
                tracing::debug!("Request gone, dropping delayed transition");
            }
        }

        outcome
    }

    async fn try_fire(&self, entry: &ScheduledTransition, now: DateTime<Utc>) -> Result<FireOutcome> {
        let _lease = self.engine.lease(entry.request_id)?;
        let request = self.engine.store().get(entry.request_id).await?;

        if request.stage != entry.from {
            return Ok(FireOutcome::Stale {
                current: request.stage,
            });
        }

        let rule = self.engine.catalog().find_rule(request.category)?;
        // Only delayed catalog edges fire from a timer. Anything else (an edge that vanished
        // in a reload, or one that was never time-delayed) is dropped as stale.
        let Some(transition) = rule
            .transition(&entry.transition_id)
            .filter(|transition| transition.from == request.stage)
            .filter(|transition| transition.trigger.delay().is_some())
        else {
            return Ok(FireOutcome::Stale {
                current: request.stage,
            });
        };

        if let Evaluation::Unsatisfied(shortfall) = self
            .engine
            .evaluator()
            .evaluate(&request, &transition.conditions)
        {
            return Ok(FireOutcome::Blocked {
                reason: shortfall.to_string(),
                retry_at: queue::due_after(now, Duration::from_millis(self.config.blocked_recheck_ms)),
            });
        }

        let outcome = request.advance(transition, &Actor::system(), None, Utc::now())?;
        let outcome = self.engine.commit(outcome).await?;
        self.engine.dispatch(&outcome).await;

        Ok(FireOutcome::Applied { to: outcome.to })
    }

    /// Try automatic transitions on every live request. Returns how many advanced.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<usize> {
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("covenant_sweep_in_progress").set(1.0);
        // Cleared on every exit, including a failed page load.
        let _guard = scopeguard::guard((), |_| {
            metrics::gauge!("covenant_sweep_in_progress").set(0.0);
        });
        let batch_size = self.config.sweep_batch_size.max(1);
        let mut after = None;
        let mut advanced = 0;

        loop {
            let page = self.engine.store().list_active(after, batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            for request in &page {
                if self.engine.is_in_flight(request.id) {
                    tracing::debug!(request_id = %request.id, "Skipping busy request in sweep");
                    continue;
                }
                match self.engine.advance_automatic(request.id).await {
                    Ok(Some(outcome)) => {
                        self.engine.dispatch(&outcome).await;
                        advanced += 1;
                    }
                    Ok(None) => {}
                    Err(WorkflowError::PreconditionsNotMet(reason)) => {
                        tracing::trace!(request_id = %request.id, reason = %reason, "Not ready to advance");
                    }
                    Err(WorkflowError::TransitionInProgress(_))
                    | Err(WorkflowError::RequestNotFound(_)) => {
                        tracing::debug!(request_id = %request.id, "Request changed during sweep, skipping");
                    }
                    Err(e) => {
                        tracing::error!(request_id = %request.id, error = %e, "Sweep failed for request");
                    }
                }
            }

            if page.len() < batch_size {
                break;
            }
        }

        if advanced > 0 {
            self.counters
                .transitions_applied
                .fetch_add(advanced as u64, Ordering::Relaxed);
            metrics::counter!("covenant_sweep_advanced_total").increment(advanced as u64);
            tracing::info!(advanced, "Sweep advanced requests");
        } else {
            tracing::debug!("Sweep found nothing to advance");
        }

        Ok(advanced)
    }

    /// Run the scheduler loop until the shutdown token is cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            timer_poll_interval_ms = self.config.timer_poll_interval_ms,
            "Scheduler starting"
        );

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let counters = self.counters.clone();
            let timers = self.engine.timers().clone();
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let stats = counters.snapshot();
                            tracing::debug!(
                                pending_timers = timers.len(),
                                sweeps = stats.sweeps,
                                applied = stats.transitions_applied,
                                stale_skipped = stats.stale_skipped,
                                "Scheduler status"
                            );
                        }
                        _ = shutdown_token.cancelled() => break,
                    }
                }
            });
        }

        let mut timer_interval =
            tokio::time::interval(Duration::from_millis(self.config.timer_poll_interval_ms.max(1)));
        let mut sweep_interval =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));

        loop {
            tokio::select! {
                _ = timer_interval.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }
}
