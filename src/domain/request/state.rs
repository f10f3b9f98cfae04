//! Core types for review requests.
//!
//! A [`ReviewRequest`] is the aggregate root: it carries its current [`Stage`], the evidence
//! collected so far (documents, sign-offs, votes, forms, inspections) and an append-only stage
//! history. The stage only ever changes through a validated transition, see
//! [`super::transitions`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Unique identifier for a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

/// Short form for log lines: the first hex group of the uuid.
impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = Uuid::encode_buffer();
        let hex = self.0.simple().encode_lower(&mut buf);
        f.write_str(&hex[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Named point in the review lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Submitted,
    UnderReview,
    NeighborSignoff,
    BoardVoting,
    Approved,
    Denied,
    AppealPending,
    InProgress,
    InspectionRequired,
    InspectionFailed,
    Completed,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Submitted,
        Stage::UnderReview,
        Stage::NeighborSignoff,
        Stage::BoardVoting,
        Stage::Approved,
        Stage::Denied,
        Stage::AppealPending,
        Stage::InProgress,
        Stage::InspectionRequired,
        Stage::InspectionFailed,
        Stage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Submitted => "submitted",
            Stage::UnderReview => "under-review",
            Stage::NeighborSignoff => "neighbor-signoff",
            Stage::BoardVoting => "board-voting",
            Stage::Approved => "approved",
            Stage::Denied => "denied",
            Stage::AppealPending => "appeal-pending",
            Stage::InProgress => "in-progress",
            Stage::InspectionRequired => "inspection-required",
            Stage::InspectionFailed => "inspection-failed",
            Stage::Completed => "completed",
        }
    }

    /// Terminal stages only accept edges the rule catalog explicitly defines (appeals).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Denied | Stage::InspectionFailed
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| WorkflowError::ValidationError(format!("Invalid stage: {}", s)))
    }
}

/// Kind of improvement being reviewed. Drives which rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Exterior,
    Fence,
    Landscaping,
    Paint,
    Addition,
    Pool,
    Solar,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Exterior => "exterior",
            Category::Fence => "fence",
            Category::Landscaping => "landscaping",
            Category::Paint => "paint",
            Category::Addition => "addition",
            Category::Pool => "pool",
            Category::Solar => "solar",
            Category::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role an actor holds when asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Homeowner,
    Neighbor,
    BoardMember,
    Captain,
    Management,
    Admin,
    /// The engine itself (scheduler sweeps and timers). Never parsed or deserialized, so callers
    /// cannot claim it.
    #[serde(skip_deserializing)]
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Homeowner => "homeowner",
            Role::Neighbor => "neighbor",
            Role::BoardMember => "board-member",
            Role::Captain => "captain",
            Role::Management => "management",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "homeowner" => Ok(Role::Homeowner),
            "neighbor" => Ok(Role::Neighbor),
            "board-member" | "board_member" | "board" => Ok(Role::BoardMember),
            "captain" => Ok(Role::Captain),
            "management" | "manager" => Ok(Role::Management),
            "admin" => Ok(Role::Admin),
            _ => Err(WorkflowError::ValidationError(format!(
                "Invalid role: {}",
                s
            ))),
        }
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The identity used for engine-initiated transitions.
    pub fn system() -> Self {
        Self::new("system", Role::System)
    }
}

// ============================================================================
// Evidence
// ============================================================================

/// A plan, drawing, permit or photo attached to the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    /// Free-form document kind, e.g. "permit" or "site-plan".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Conversation entry between the homeowner and reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// CC&R section referenced by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAttachment {
    pub section: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormStatus {
    Pending,
    Completed,
}

/// A form the homeowner (or a contractor) has been asked to fill in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormAssignment {
    pub form_id: String,
    pub assignee: String,
    pub status: FormStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignoffStatus {
    Pending,
    Approved,
    Objected,
}

/// A neighbor's recorded position on the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborSignoff {
    pub neighbor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: SignoffStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoteValue {
    Approve,
    Deny,
    Abstain,
}

/// A board member's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardVote {
    pub voter_id: String,
    pub value: VoteValue,
    pub cast_at: DateTime<Utc>,
}

/// Homeowner appeal against a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appeal {
    pub filed_by: String,
    pub reason: String,
    pub filed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InspectionStatus {
    Scheduled,
    Passed,
    Failed,
}

/// Post-construction inspection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    pub inspector: String,
    pub status: InspectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspected_at: Option<DateTime<Utc>>,
}

/// One entry in the append-only stage history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
    pub entered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ============================================================================
// Aggregate
// ============================================================================

/// Caller-supplied data for a new request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReviewRequest {
    pub category: Category,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub documents: Vec<Document>,
}

/// An architectural review request.
///
/// Snapshots are immutable from the engine's point of view: every transition produces a new
/// value, the input is never touched. Invariant: `stage == history.last().stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: RequestId,
    pub category: Category,
    pub stage: Stage,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub attachments: Vec<RuleAttachment>,
    #[serde(default)]
    pub forms: Vec<FormAssignment>,
    #[serde(default)]
    pub signoffs: Vec<NeighborSignoff>,
    #[serde(default)]
    pub votes: Vec<BoardVote>,
    #[serde(default)]
    pub appeals: Vec<Appeal>,
    #[serde(default)]
    pub inspections: Vec<Inspection>,
    pub history: Vec<StageEntry>,
}

impl ReviewRequest {
    /// Check if this request sits in a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// The most recent history entry (the one for the current stage).
    pub fn current_entry(&self) -> Option<&StageEntry> {
        self.history.last()
    }

    /// When the request entered its current stage.
    pub fn stage_entered_at(&self) -> DateTime<Utc> {
        self.current_entry()
            .map(|entry| entry.entered_at)
            .unwrap_or(self.created_at)
    }

    /// True if the stage/history invariant holds.
    pub fn is_consistent(&self) -> bool {
        self.current_entry()
            .is_some_and(|entry| entry.stage == self.stage)
    }

    pub fn approved_signoffs(&self) -> usize {
        self.signoffs
            .iter()
            .filter(|s| s.status == SignoffStatus::Approved)
            .count()
    }

    pub fn approving_votes(&self) -> usize {
        self.votes
            .iter()
            .filter(|v| v.value == VoteValue::Approve)
            .count()
    }

    pub fn completed_forms(&self) -> usize {
        self.forms
            .iter()
            .filter(|f| f.status == FormStatus::Completed)
            .count()
    }

    pub fn has_passed_inspection(&self) -> bool {
        self.inspections
            .iter()
            .any(|i| i.status == InspectionStatus::Passed)
    }
}
