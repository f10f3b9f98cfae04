//! Notification intents emitted by transitions.
//!
//! The engine never delivers anything itself. Intents are handed to the caller (or to an
//! [`crate::notify::IntentSink`] for scheduler-driven transitions) and then discarded.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentKind {
    Notify,
    Assign,
    Remind,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Notify => "notify",
            IntentKind::Assign => "assign",
            IntentKind::Remind => "remind",
        }
    }
}

/// "Something should be communicated to these people."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub kind: IntentKind,
    /// Resolved user ids, or `role:<role>` for role-wide delivery.
    pub targets: Vec<String>,
    pub template: String,
    pub data: serde_json::Value,
}
