//! Stage transitions for review requests.
//!
//! Unlike a typestate machine, the legal edge set here comes from a rule table, so the
//! executor checks at runtime that the request still sits in the edge's `from` stage. Every
//! call produces a brand new snapshot; the input request is never modified.
//!
//! ```text
//! ReviewRequest ──advance(transition)──> TransitionOutcome {
//!     request:  snapshot with stage = transition.to, history + 1 entry
//!     intents:  one NotificationIntent per declared Action
//! }
//! ```
//!
//! Validation of roles and conditions happens one layer up, in
//! [`crate::engine::WorkflowEngine`]. The executor only enforces the stale-stage guard.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::domain::intent::NotificationIntent;
use crate::domain::rule::{Action, Recipient, Transition, TransitionId, Trigger};
use crate::error::{Result, WorkflowError};

use super::state::{Actor, NewReviewRequest, RequestId, ReviewRequest, Stage, StageEntry};

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// The new snapshot. The caller persists it.
    pub request: ReviewRequest,
    pub transition_id: TransitionId,
    pub from: Stage,
    pub to: Stage,
    /// Side effects for the caller to dispatch.
    pub intents: Vec<NotificationIntent>,
}

impl ReviewRequest {
    /// Create a freshly submitted request. History starts as `[submitted]`.
    pub fn submit(input: NewReviewRequest, submitter: &Actor, at: DateTime<Utc>) -> Self {
        ReviewRequest {
            id: RequestId::from(Uuid::new_v4()),
            category: input.category,
            stage: Stage::Submitted,
            title: input.title,
            description: input.description,
            submitted_by: submitter.id.clone(),
            created_at: at,
            updated_at: at,
            documents: input.documents,
            messages: Vec::new(),
            attachments: Vec::new(),
            forms: Vec::new(),
            signoffs: Vec::new(),
            votes: Vec::new(),
            appeals: Vec::new(),
            inspections: Vec::new(),
            history: vec![StageEntry {
                stage: Stage::Submitted,
                entered_at: at,
                entered_by: submitter.id.clone(),
                note: Some("Request submitted".to_string()),
            }],
        }
    }

    /// Apply `transition` and return the new snapshot plus its intents.
    ///
    /// Fails with `IllegalTransition` if the request is no longer in `transition.from`; a
    /// stale timer must never move a request that has already moved on.
    pub fn advance(
        &self,
        transition: &Transition,
        actor: &Actor,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        if self.stage != transition.from {
            return Err(WorkflowError::IllegalTransition {
                request_id: self.id,
                from: self.stage,
                to: transition.to,
            });
        }

        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_note(transition));

        let mut request = self.clone();
        request.stage = transition.to;
        request.updated_at = at;
        request.history.push(StageEntry {
            stage: transition.to,
            entered_at: at,
            entered_by: actor.id.clone(),
            note: Some(note.clone()),
        });

        let intents = transition
            .actions
            .iter()
            .map(|action| build_intent(action, &request, transition, actor, &note))
            .collect();

        tracing::debug!(
            request_id = %self.id,
            transition_id = %transition.id,
            from = %transition.from,
            to = %transition.to,
            actor = %actor.id,
            "Executed transition"
        );

        Ok(TransitionOutcome {
            request,
            transition_id: transition.id.clone(),
            from: transition.from,
            to: transition.to,
            intents,
        })
    }
}

fn default_note(transition: &Transition) -> String {
    match transition.trigger {
        Trigger::Manual => format!("Moved from {} to {}", transition.from, transition.to),
        Trigger::Automatic => format!("Automatically advanced to {}", transition.to),
        Trigger::Delayed { .. } => {
            format!("Advanced to {} after scheduled delay", transition.to)
        }
    }
}

fn build_intent(
    action: &Action,
    request: &ReviewRequest,
    transition: &Transition,
    actor: &Actor,
    note: &str,
) -> NotificationIntent {
    NotificationIntent {
        kind: action.kind,
        targets: resolve_targets(request, &action.targets),
        template: action.template.clone(),
        data: json!({
            "request_id": request.id.0,
            "title": request.title,
            "category": request.category,
            "from": transition.from,
            "to": transition.to,
            "actor": actor.id,
            "note": note,
        }),
    }
}

/// Expand recipients against the snapshot, keeping first-seen order without duplicates.
fn resolve_targets(request: &ReviewRequest, recipients: &[Recipient]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    let mut push = |target: String| {
        if !targets.contains(&target) {
            targets.push(target);
        }
    };

    for recipient in recipients {
        match recipient {
            Recipient::Submitter => push(request.submitted_by.clone()),
            Recipient::Role(role) => push(format!("role:{}", role)),
            Recipient::Neighbors => request
                .signoffs
                .iter()
                .for_each(|s| push(s.neighbor_id.clone())),
            Recipient::Voters => request
                .votes
                .iter()
                .for_each(|v| push(v.voter_id.clone())),
            Recipient::User(id) => push(id.clone()),
        }
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::IntentKind;
    use crate::domain::request::{
        Category, NeighborSignoff, Role, SignoffStatus,
    };
    use chrono::TimeZone;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn submitted() -> ReviewRequest {
        ReviewRequest::submit(
            NewReviewRequest {
                category: Category::Fence,
                title: "Replace side fence".to_string(),
                description: "6ft cedar".to_string(),
                documents: vec![],
            },
            &Actor::new("owner-7", Role::Homeowner),
            at(0),
        )
    }

    #[test]
    fn test_submit_starts_history() {
        let request = submitted();
        assert_eq!(request.stage, Stage::Submitted);
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.history[0].entered_by, "owner-7");
        assert_eq!(request.submitted_by, "owner-7");
        assert!(request.is_consistent());
    }

    #[test]
    fn test_advance_appends_history_and_leaves_input_alone() {
        let request = submitted();
        let before = request.clone();
        let transition = Transition::manual("review", Stage::Submitted, Stage::UnderReview);
        let actor = Actor::new("mgr-1", Role::Management);

        let outcome = request
            .advance(&transition, &actor, Some("  Looks complete  ".to_string()), at(5))
            .unwrap();

        assert_eq!(request, before);
        assert_eq!(outcome.request.stage, Stage::UnderReview);
        assert_eq!(outcome.request.updated_at, at(5));
        assert_eq!(outcome.request.history.len(), 2);
        assert_eq!(outcome.request.history[..1], before.history[..]);
        let last = outcome.request.history.last().unwrap();
        assert_eq!(last.stage, Stage::UnderReview);
        assert_eq!(last.entered_by, "mgr-1");
        assert_eq!(last.note.as_deref(), Some("Looks complete"));
        assert!(outcome.request.is_consistent());
        assert_eq!(outcome.from, Stage::Submitted);
        assert_eq!(outcome.to, Stage::UnderReview);
    }

    #[test]
    fn test_default_note_depends_on_trigger() {
        let request = submitted();
        let actor = Actor::system();

        let manual = Transition::manual("m", Stage::Submitted, Stage::UnderReview);
        let outcome = request.advance(&manual, &actor, None, at(1)).unwrap();
        assert_eq!(
            outcome.request.history[1].note.as_deref(),
            Some("Moved from submitted to under-review")
        );

        let delayed = Transition::delayed("d", Stage::Submitted, Stage::UnderReview, 1000);
        let outcome = request
            .advance(&delayed, &actor, Some("   ".to_string()), at(1))
            .unwrap();
        assert_eq!(
            outcome.request.history[1].note.as_deref(),
            Some("Advanced to under-review after scheduled delay")
        );
    }

    #[test]
    fn test_stale_stage_is_rejected() {
        let request = submitted();
        let transition =
            Transition::automatic("signoffs", Stage::NeighborSignoff, Stage::BoardVoting);

        let err = request
            .advance(&transition, &Actor::system(), None, at(1))
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::IllegalTransition {
                from: Stage::Submitted,
                to: Stage::BoardVoting,
                ..
            }
        ));
    }

    #[test]
    fn test_intents_resolve_recipients_without_duplicates() {
        let mut request = submitted();
        request.stage = Stage::UnderReview;
        request.history.push(StageEntry {
            stage: Stage::UnderReview,
            entered_at: at(1),
            entered_by: "mgr-1".to_string(),
            note: None,
        });
        for neighbor in ["n-1", "n-2", "n-1"] {
            request.signoffs.push(NeighborSignoff {
                neighbor_id: neighbor.to_string(),
                address: None,
                status: SignoffStatus::Pending,
                comment: None,
                recorded_at: at(1),
            });
        }

        let transition = Transition::manual("ask", Stage::UnderReview, Stage::NeighborSignoff)
            .then(Action::remind(
                "neighbor-signoff-requested",
                vec![Recipient::Neighbors, Recipient::Submitter],
            ))
            .then(Action::notify(
                "stage-changed",
                vec![
                    Recipient::Submitter,
                    Recipient::Role(Role::Management),
                    Recipient::User("owner-7".to_string()),
                ],
            ));

        let outcome = request
            .advance(&transition, &Actor::new("cap-1", Role::Captain), None, at(2))
            .unwrap();

        assert_eq!(outcome.intents.len(), 2);
        assert_eq!(outcome.intents[0].kind, IntentKind::Remind);
        assert_eq!(outcome.intents[0].targets, vec!["n-1", "n-2", "owner-7"]);
        assert_eq!(outcome.intents[1].targets, vec!["owner-7", "role:management"]);
        assert_eq!(outcome.intents[1].template, "stage-changed");
        assert_eq!(outcome.intents[1].data["to"], "neighbor-signoff");
        assert_eq!(outcome.intents[1].data["actor"], "cap-1");
    }
}
