//! Error types for the review workflow engine.

use thiserror::Error;

use crate::domain::request::{Category, RequestId, Role, Stage};

/// Result type alias using the covenant error type.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Main error type for the workflow engine.
///
/// None of these are fatal: a failed operation leaves the request exactly as it was.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// No rule matches the request category and no default rule is registered.
    #[error("No workflow rule applies to category '{0}'")]
    NoApplicableRule(Category),

    /// The (from, to) edge is not part of the rule's transition graph.
    #[error("Cannot move request {request_id} to '{to}' from its current stage '{from}'")]
    IllegalTransition {
        request_id: RequestId,
        from: Stage,
        to: Stage,
    },

    /// The actor's role is not allowed to take this edge.
    #[error("Role '{role}' may not move a request from '{from}' to '{to}'")]
    Unauthorized { role: Role, from: Stage, to: Stage },

    /// A required condition on the edge does not hold. The reason is user-facing.
    #[error("{0}")]
    PreconditionsNotMet(String),

    /// Another transition is already running for this request. Retry shortly.
    #[error("A transition is already in progress for request {0}")]
    TransitionInProgress(RequestId),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Request already exists
    #[error("Request already exists: {0}")]
    RequestExists(RequestId),

    /// The rule set failed validation
    #[error("Invalid rule catalog: {0}")]
    InvalidCatalog(String),

    /// Validation error (e.g., bad role string, evidence update touching the stage)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Returns true if the caller should retry the same operation after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::TransitionInProgress(_))
    }

    /// Low-cardinality label used for rejection metrics.
    pub fn reason_label(&self) -> &'static str {
        match self {
            WorkflowError::NoApplicableRule(_) => "no_applicable_rule",
            WorkflowError::IllegalTransition { .. } => "illegal_transition",
            WorkflowError::Unauthorized { .. } => "unauthorized",
            WorkflowError::PreconditionsNotMet(_) => "preconditions_not_met",
            WorkflowError::TransitionInProgress(_) => "transition_in_progress",
            WorkflowError::RequestNotFound(_) => "request_not_found",
            WorkflowError::RequestExists(_) => "request_exists",
            WorkflowError::InvalidCatalog(_) => "invalid_catalog",
            WorkflowError::ValidationError(_) => "validation",
            WorkflowError::Serialization(_) => "serialization",
            WorkflowError::Other(_) => "other",
        }
    }
}
