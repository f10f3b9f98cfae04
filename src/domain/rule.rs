//! Rule, transition, condition and action value objects.
//!
//! A [`Rule`] is the transition graph for a set of request categories. Rules are immutable once
//! loaded and shared read-only across every request of a matching category.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::intent::IntentKind;
use super::request::{Category, Role, Stage};

/// Identifier of a transition within a rule, e.g. "signoffs-complete".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(pub String);

impl std::fmt::Display for TransitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransitionId {
    fn from(s: &str) -> Self {
        TransitionId(s.to_string())
    }
}

/// What fires a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Trigger {
    /// Only on explicit request by a permitted actor.
    Manual,
    /// Applied by the scheduler sweep as soon as the conditions hold.
    Automatic,
    /// Re-checked and applied once `delay_ms` has passed since the request entered `from`.
    Delayed { delay_ms: u64 },
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Automatic => "automatic",
            Trigger::Delayed { .. } => "delayed",
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Trigger::Delayed { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }

    /// True for triggers the engine fires on its own.
    pub fn is_engine_driven(&self) -> bool {
        !matches!(self, Trigger::Manual)
    }
}

fn default_min() -> u32 {
    1
}

fn default_required() -> bool {
    true
}

/// Predicate over a request's evidence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConditionKind {
    /// Sign-offs with status approved.
    NeighborSignoffs {
        #[serde(default = "default_min")]
        min: u32,
    },
    /// Votes with value approve. Deny and abstain never count.
    BoardVotes {
        #[serde(default = "default_min")]
        min: u32,
    },
    /// Form assignments with status completed.
    FormsCompleted {
        #[serde(default = "default_min")]
        min: u32,
    },
    /// At least one inspection with status passed.
    InspectionPassed,
    /// At least one document of any kind.
    DocumentsPresent,
    /// A named predicate registered with the engine.
    Custom { name: String },
}

/// A gate on a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    #[serde(flatten)]
    pub kind: ConditionKind,
    /// Optional conditions never block; they only show up as advisory required actions.
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Condition {
    pub fn required(kind: ConditionKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }

    pub fn advisory(kind: ConditionKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    pub fn neighbor_signoffs(min: u32) -> Self {
        Self::required(ConditionKind::NeighborSignoffs { min })
    }

    pub fn board_votes(min: u32) -> Self {
        Self::required(ConditionKind::BoardVotes { min })
    }

    pub fn forms_completed(min: u32) -> Self {
        Self::required(ConditionKind::FormsCompleted { min })
    }

    pub fn inspection_passed() -> Self {
        Self::required(ConditionKind::InspectionPassed)
    }

    pub fn documents_present() -> Self {
        Self::required(ConditionKind::DocumentsPresent)
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::required(ConditionKind::Custom { name: name.into() })
    }
}

/// Who an action addresses. Resolved against the post-transition snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recipient {
    Submitter,
    Role(Role),
    /// Every neighbor with a recorded sign-off.
    Neighbors,
    /// Every board member with a recorded vote.
    Voters,
    User(String),
}

/// Declarative side effect of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: IntentKind,
    pub targets: Vec<Recipient>,
    pub template: String,
}

impl Action {
    pub fn notify(template: impl Into<String>, targets: Vec<Recipient>) -> Self {
        Self {
            kind: IntentKind::Notify,
            targets,
            template: template.into(),
        }
    }

    pub fn assign(template: impl Into<String>, targets: Vec<Recipient>) -> Self {
        Self {
            kind: IntentKind::Assign,
            targets,
            template: template.into(),
        }
    }

    pub fn remind(template: impl Into<String>, targets: Vec<Recipient>) -> Self {
        Self {
            kind: IntentKind::Remind,
            targets,
            template: template.into(),
        }
    }
}

/// A permitted edge in a rule's stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub from: Stage,
    pub to: Stage,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Roles allowed to request this edge. Empty means any role.
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Transition {
    fn new(id: &str, from: Stage, to: Stage, trigger: Trigger) -> Self {
        Self {
            id: TransitionId::from(id),
            from,
            to,
            trigger,
            conditions: Vec::new(),
            actions: Vec::new(),
            roles: Vec::new(),
        }
    }

    pub fn manual(id: &str, from: Stage, to: Stage) -> Self {
        Self::new(id, from, to, Trigger::Manual)
    }

    pub fn automatic(id: &str, from: Stage, to: Stage) -> Self {
        Self::new(id, from, to, Trigger::Automatic)
    }

    pub fn delayed(id: &str, from: Stage, to: Stage, delay_ms: u64) -> Self {
        Self::new(id, from, to, Trigger::Delayed { delay_ms })
    }

    pub fn roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn permits(&self, role: Role) -> bool {
        self.roles.is_empty() || self.roles.contains(&role)
    }
}

/// The transition graph for a set of categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub categories: BTreeSet<Category>,
    pub transitions: Vec<Transition>,
}

impl Rule {
    pub fn applies_to(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }

    /// The edge for (from, to), if the graph has one.
    pub fn find_transition(&self, from: Stage, to: Stage) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    pub fn transition(&self, id: &TransitionId) -> Option<&Transition> {
        self.transitions.iter().find(|t| &t.id == id)
    }

    /// Edges leaving `stage`, in catalog order.
    pub fn outgoing(&self, stage: Stage) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(move |t| t.from == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_json_defaults() {
        let condition: Condition =
            serde_json::from_str(r#"{"kind":"neighbor-signoffs","min":2}"#).unwrap();
        assert_eq!(condition, Condition::neighbor_signoffs(2));

        let condition: Condition = serde_json::from_str(r#"{"kind":"board-votes"}"#).unwrap();
        assert_eq!(condition.kind, ConditionKind::BoardVotes { min: 1 });
        assert!(condition.required);

        let condition: Condition =
            serde_json::from_str(r#"{"kind":"custom","name":"permit-on-file","required":false}"#)
                .unwrap();
        assert_eq!(
            condition,
            Condition::advisory(ConditionKind::Custom {
                name: "permit-on-file".to_string()
            })
        );
    }

    #[test]
    fn test_trigger_json_shape() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"kind":"delayed","delay_ms":1800000}"#).unwrap();
        assert_eq!(trigger.delay(), Some(Duration::from_secs(1800)));
        assert!(trigger.is_engine_driven());
        assert!(!Trigger::Manual.is_engine_driven());
    }

    #[test]
    fn test_empty_roles_permit_everyone() {
        let open = Transition::manual("open", Stage::Approved, Stage::InProgress);
        assert!(open.permits(Role::Homeowner));
        assert!(open.permits(Role::System));

        let gated = open.roles([Role::Management]);
        assert!(gated.permits(Role::Management));
        assert!(!gated.permits(Role::Homeowner));
    }

    #[test]
    fn test_find_transition_and_outgoing() {
        let rule = Rule {
            id: "r".to_string(),
            name: "R".to_string(),
            categories: BTreeSet::from([Category::Fence]),
            transitions: vec![
                Transition::manual("a", Stage::UnderReview, Stage::NeighborSignoff),
                Transition::manual("b", Stage::UnderReview, Stage::Denied),
                Transition::automatic("c", Stage::NeighborSignoff, Stage::BoardVoting),
            ],
        };

        assert!(rule.applies_to(Category::Fence));
        assert!(!rule.applies_to(Category::Pool));
        assert_eq!(
            rule.find_transition(Stage::UnderReview, Stage::Denied)
                .map(|t| t.id.0.as_str()),
            Some("b")
        );
        assert!(
            rule.find_transition(Stage::Submitted, Stage::Completed)
                .is_none()
        );
        assert_eq!(rule.outgoing(Stage::UnderReview).count(), 2);
        assert!(rule.transition(&TransitionId::from("c")).is_some());
    }
}
