//! Hand-off point for notification intents.
//!
//! Transitions requested through the facade return their intents to the caller. Transitions
//! the engine makes on its own (delayed timers, automatic sweeps) have no caller waiting, so
//! their intents go to an [`IntentSink`] instead. Delivery (email, SMS, in-app) lives behind
//! the sink and is not this crate's concern.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::intent::NotificationIntent;
use crate::domain::request::RequestId;
use crate::error::Result;

/// Receives intents produced by engine-driven transitions.
///
/// Implementations must not block for long: the scheduler awaits `dispatch` inline.
#[async_trait]
pub trait IntentSink: Send + Sync {
    async fn dispatch(&self, request_id: RequestId, intents: &[NotificationIntent]) -> Result<()>;
}

/// Logs every intent and drops it. Useful as a default while no notifier is wired up.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl IntentSink for TracingSink {
    async fn dispatch(&self, request_id: RequestId, intents: &[NotificationIntent]) -> Result<()> {
        for intent in intents {
            tracing::info!(
                request_id = %request_id,
                kind = intent.kind.as_str(),
                template = %intent.template,
                targets = ?intent.targets,
                "Notification intent"
            );
        }
        Ok(())
    }
}

/// A dispatched batch as seen by [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub request_id: RequestId,
    pub intents: Vec<NotificationIntent>,
}

/// Keeps everything it receives in memory, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    dispatched: Arc<Mutex<Vec<Dispatched>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch received so far, in order.
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().clone()
    }

    /// Flattened templates of every intent received for `request_id`.
    pub fn templates_for(&self, request_id: RequestId) -> Vec<String> {
        self.dispatched
            .lock()
            .iter()
            .filter(|batch| batch.request_id == request_id)
            .flat_map(|batch| batch.intents.iter().map(|i| i.template.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.dispatched.lock().clear();
    }
}

#[async_trait]
impl IntentSink for RecordingSink {
    async fn dispatch(&self, request_id: RequestId, intents: &[NotificationIntent]) -> Result<()> {
        self.dispatched.lock().push(Dispatched {
            request_id,
            intents: intents.to_vec(),
        });
        Ok(())
    }
}
