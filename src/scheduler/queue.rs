//! Pending delayed transitions.
//!
//! Entries are keyed by (request id, transition id): scheduling the same key again replaces
//! the earlier entry instead of stacking a second timer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::domain::request::{RequestId, Stage};
use crate::domain::rule::{Transition, TransitionId};

/// A delayed transition waiting for its due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTransition {
    pub request_id: RequestId,
    pub transition_id: TransitionId,
    /// Stage the request must still be in when the timer fires.
    pub from: Stage,
    pub to: Stage,
    pub due_at: DateTime<Utc>,
    /// How many times this entry has been re-armed after a blocked or in-flight fire.
    pub attempts: u32,
}

impl ScheduledTransition {
    pub fn new(request_id: RequestId, transition: &Transition, due_at: DateTime<Utc>) -> Self {
        Self {
            request_id,
            transition_id: transition.id.clone(),
            from: transition.from,
            to: transition.to,
            due_at,
            attempts: 0,
        }
    }

    /// Same entry, due again at `due_at`.
    pub fn rearm(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = due_at;
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

/// `start + delay`, saturating instead of overflowing.
pub fn due_after(start: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

type Key = (RequestId, TransitionId);

/// In-memory timer queue shared by the engine (which registers follow-ups) and the scheduler
/// (which fires them).
#[derive(Debug, Default)]
pub struct DelayedQueue {
    entries: Mutex<BTreeMap<Key, ScheduledTransition>>,
}

impl DelayedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&self, len: usize) {
        metrics::gauge!("covenant_delayed_transitions_pending").set(len as f64);
    }

    /// Register an entry. Returns true if it replaced an existing one.
    pub fn schedule(&self, entry: ScheduledTransition) -> bool {
        let mut entries = self.entries.lock();
        tracing::debug!(
            request_id = %entry.request_id,
            transition_id = %entry.transition_id,
            due_at = %entry.due_at,
            "Scheduled delayed transition"
        );
        let replaced = entries
            .insert((entry.request_id, entry.transition_id.clone()), entry)
            .is_some();
        self.report(entries.len());
        replaced
    }

    /// Drop one pending entry. Returns true if something was removed.
    pub fn cancel(&self, request_id: RequestId, transition_id: &TransitionId) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries
            .remove(&(request_id, transition_id.clone()))
            .is_some();
        self.report(entries.len());
        removed
    }

    /// Drop every pending entry of a request. Returns how many were removed.
    pub fn cancel_request(&self, request_id: RequestId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _), _| *id != request_id);
        let removed = before - entries.len();
        self.report(entries.len());
        removed
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledTransition> {
        let mut entries = self.entries.lock();
        let due_keys: Vec<Key> = entries
            .iter()
            .filter(|(_, entry)| entry.due_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut due: Vec<ScheduledTransition> = due_keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .collect();
        due.sort_by_key(|entry| entry.due_at);
        self.report(entries.len());
        due
    }

    /// Earliest due time, if anything is pending.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.lock().values().map(|entry| entry.due_at).min()
    }

    /// Pending entries of one request.
    pub fn pending_for(&self, request_id: RequestId) -> Vec<ScheduledTransition> {
        self.entries
            .lock()
            .range((request_id, TransitionId(String::new()))..)
            .take_while(|((id, _), _)| *id == request_id)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
