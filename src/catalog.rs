//! Rule catalog.
//!
//! A [`RuleSet`] is a validated, immutable collection of rules. The [`RuleCatalog`] holds the
//! current rule set behind a lock so it can be hot-reloaded: a reload validates the new set
//! first and then swaps the whole thing in one step. Readers grab an `Arc<Rule>` and keep
//! using it for the rest of their transition even if a reload happens meanwhile.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::request::{Category, Role, Stage};
use crate::domain::rule::{Action, Condition, ConditionKind, Recipient, Rule, Transition};
use crate::error::{Result, WorkflowError};

/// A validated set of rules plus an optional default rule id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RuleSetDef", into = "RuleSetDef")]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    default_rule: Option<String>,
}

/// Wire format of a rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleSetDef {
    rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_rule: Option<String>,
}

impl TryFrom<RuleSetDef> for RuleSet {
    type Error = WorkflowError;

    fn try_from(def: RuleSetDef) -> Result<Self> {
        RuleSet::new(def.rules, def.default_rule)
    }
}

impl From<RuleSet> for RuleSetDef {
    fn from(set: RuleSet) -> Self {
        RuleSetDef {
            rules: set.rules.iter().map(|r| (**r).clone()).collect(),
            default_rule: set.default_rule,
        }
    }
}

impl RuleSet {
    /// Build and validate a rule set.
    ///
    /// Rejects duplicate rule ids, categories claimed by more than one rule, a default rule
    /// that does not exist, duplicate transition ids or (from, to) pairs inside a rule, and
    /// self-loops.
    pub fn new(rules: Vec<Rule>, default_rule: Option<String>) -> Result<Self> {
        let mut rule_ids = HashSet::new();
        let mut claimed: HashSet<Category> = HashSet::new();

        for rule in &rules {
            if rule.id.trim().is_empty() {
                return Err(WorkflowError::InvalidCatalog(
                    "rule id must not be empty".to_string(),
                ));
            }
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(WorkflowError::InvalidCatalog(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
            for category in &rule.categories {
                if !claimed.insert(*category) {
                    return Err(WorkflowError::InvalidCatalog(format!(
                        "category '{}' is claimed by more than one rule",
                        category
                    )));
                }
            }

            let mut transition_ids = HashSet::new();
            let mut edges = HashSet::new();
            for transition in &rule.transitions {
                if !transition_ids.insert(&transition.id) {
                    return Err(WorkflowError::InvalidCatalog(format!(
                        "rule '{}' has duplicate transition id '{}'",
                        rule.id, transition.id
                    )));
                }
                if transition.from == transition.to {
                    return Err(WorkflowError::InvalidCatalog(format!(
                        "rule '{}' transition '{}' loops on '{}'",
                        rule.id, transition.id, transition.from
                    )));
                }
                if !edges.insert((transition.from, transition.to)) {
                    return Err(WorkflowError::InvalidCatalog(format!(
                        "rule '{}' defines {} -> {} more than once",
                        rule.id, transition.from, transition.to
                    )));
                }
            }
        }

        if let Some(default_rule) = &default_rule
            && !rule_ids.contains(default_rule.as_str())
        {
            return Err(WorkflowError::InvalidCatalog(format!(
                "default rule '{}' is not defined",
                default_rule
            )));
        }

        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            default_rule,
        })
    }

    /// Parse and validate a rule set from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn default_rule(&self) -> Option<&str> {
        self.default_rule.as_deref()
    }

    /// Exact category match, then the default rule, if any.
    pub fn find_rule(&self, category: Category) -> Option<Arc<Rule>> {
        self.rules
            .iter()
            .find(|rule| rule.applies_to(category))
            .or_else(|| {
                self.default_rule
                    .as_deref()
                    .and_then(|id| self.rules.iter().find(|rule| rule.id == id))
            })
            .cloned()
    }

    /// Names of every custom predicate referenced by any condition.
    pub fn custom_predicates(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|rule| rule.transitions.iter())
            .flat_map(|transition| transition.conditions.iter())
            .filter_map(|condition| match &condition.kind {
                ConditionKind::Custom { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Holds the active rule set.
pub struct RuleCatalog {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleCatalog {
    pub fn new(rule_set: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rule_set)),
        }
    }

    /// Look up the rule for a category.
    ///
    /// Falls back to the default rule only if one is registered. Anything else is a
    /// configuration error, never silently ignored.
    pub fn find_rule(&self, category: Category) -> Result<Arc<Rule>> {
        let rule_set = self.snapshot();
        match rule_set.find_rule(category) {
            Some(rule) => {
                if !rule.applies_to(category) {
                    tracing::debug!(
                        category = %category,
                        rule_id = %rule.id,
                        "No rule for category, using default rule"
                    );
                }
                Ok(rule)
            }
            None => {
                tracing::error!(
                    category = %category,
                    "No workflow rule applies to category and no default rule is registered"
                );
                Err(WorkflowError::NoApplicableRule(category))
            }
        }
    }

    /// The currently active rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Swap in a new rule set. The set was validated on construction, so this cannot leave
    /// the catalog half-updated.
    pub fn reload(&self, rule_set: RuleSet) {
        let rules = rule_set.rules().len();
        *self.current.write() = Arc::new(rule_set);
        tracing::info!(rules, "Rule catalog reloaded");
    }
}

// ============================================================================
// Built-in rules
// ============================================================================

/// Tunables for the built-in rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardRules {
    /// How long a submitted request waits before it moves to review on its own.
    pub review_delay_ms: u64,
    /// Approving neighbor sign-offs needed before the board votes.
    pub neighbor_signoffs: u32,
    /// Approving board votes needed for approval.
    pub board_votes: u32,
    /// Sign-offs needed for major construction (additions, pools).
    pub major_neighbor_signoffs: u32,
}

impl Default for StandardRules {
    fn default() -> Self {
        Self {
            review_delay_ms: 30 * 60 * 1000, // 30 minutes
            neighbor_signoffs: 2,
            board_votes: 3,
            major_neighbor_signoffs: 3,
        }
    }
}

/// Name of the built-in custom predicate that checks for an uploaded permit.
pub const PERMIT_ON_FILE: &str = "permit-on-file";

const REVIEWERS: [Role; 3] = [Role::Captain, Role::Management, Role::Admin];
const STAFF: [Role; 2] = [Role::Management, Role::Admin];
const BOARD: [Role; 3] = [Role::BoardMember, Role::Management, Role::Admin];

impl StandardRules {
    /// Build the built-in rule set: `standard` (default), `minor-improvement` and
    /// `major-construction`.
    pub fn build(&self) -> Result<RuleSet> {
        RuleSet::new(
            vec![self.standard(), self.minor_improvement(), self.major_construction()],
            Some("standard".to_string()),
        )
    }

    fn review_on_delay(&self) -> Transition {
        Transition::delayed(
            "begin-review",
            Stage::Submitted,
            Stage::UnderReview,
            self.review_delay_ms,
        )
        .roles(REVIEWERS)
        .then(Action::notify("request-under-review", vec![Recipient::Submitter]))
        .then(Action::assign(
            "review-assigned",
            vec![Recipient::Role(Role::Management)],
        ))
    }

    fn appeal_edges(&self, rehear_at: Stage) -> Vec<Transition> {
        vec![
            Transition::manual("file-appeal", Stage::Denied, Stage::AppealPending)
                .roles([Role::Homeowner, Role::Admin])
                .then(Action::notify(
                    "appeal-filed",
                    vec![Recipient::Role(Role::Management)],
                ))
                .then(Action::assign(
                    "appeal-review",
                    vec![Recipient::Role(Role::BoardMember)],
                )),
            Transition::manual("rehear-appeal", Stage::AppealPending, rehear_at)
                .roles(STAFF)
                .then(Action::notify("appeal-reheard", vec![Recipient::Submitter])),
            Transition::manual("uphold-denial", Stage::AppealPending, Stage::Denied)
                .roles(BOARD)
                .then(Action::notify("appeal-denied", vec![Recipient::Submitter])),
        ]
    }

    fn construction_edges(&self, inspection_conditions: Vec<Condition>) -> Vec<Transition> {
        let mut passed =
            Transition::automatic("inspection-passed", Stage::InspectionRequired, Stage::Completed)
                .roles(STAFF)
                .when(Condition::inspection_passed())
                .then(Action::notify("request-completed", vec![Recipient::Submitter]));
        passed.conditions.extend(inspection_conditions);

        vec![
            Transition::manual("start-work", Stage::Approved, Stage::InProgress)
                .roles([Role::Homeowner, Role::Management, Role::Admin])
                .then(Action::notify(
                    "construction-started",
                    vec![Recipient::Role(Role::Management)],
                )),
            Transition::manual(
                "request-inspection",
                Stage::InProgress,
                Stage::InspectionRequired,
            )
            .roles([Role::Homeowner, Role::Management, Role::Admin])
            .then(Action::assign(
                "inspection-requested",
                vec![Recipient::Role(Role::Management)],
            )),
            passed,
            Transition::manual("inspection-failed", Stage::InspectionRequired, Stage::InspectionFailed)
                .roles(STAFF)
                .then(Action::notify("inspection-failed", vec![Recipient::Submitter])),
        ]
    }

    fn voting_edges(&self, votes: u32, extra: Vec<Condition>) -> Vec<Transition> {
        let mut approve = Transition::automatic("board-approves", Stage::BoardVoting, Stage::Approved)
            .roles(BOARD)
            .when(Condition::board_votes(votes))
            .then(Action::notify(
                "request-approved",
                vec![Recipient::Submitter, Recipient::Voters],
            ));
        approve.conditions.extend(extra);

        vec![
            approve,
            Transition::manual("board-denies", Stage::BoardVoting, Stage::Denied)
                .roles(BOARD)
                .then(Action::notify(
                    "request-denied",
                    vec![Recipient::Submitter, Recipient::Voters],
                )),
        ]
    }

    fn standard(&self) -> Rule {
        let mut transitions = vec![
            self.review_on_delay(),
            Transition::manual("request-signoffs", Stage::UnderReview, Stage::NeighborSignoff)
                .roles(REVIEWERS)
                .when(Condition::documents_present())
                .then(Action::notify("signoffs-requested", vec![Recipient::Submitter]))
                .then(Action::remind(
                    "neighbor-signoff-requested",
                    vec![Recipient::Neighbors],
                )),
            Transition::manual("fast-track-vote", Stage::UnderReview, Stage::BoardVoting)
                .roles(REVIEWERS)
                .then(Action::notify(
                    "board-vote-requested",
                    vec![Recipient::Role(Role::BoardMember)],
                )),
            Transition::manual("deny-review", Stage::UnderReview, Stage::Denied)
                .roles(STAFF)
                .then(Action::notify("request-denied", vec![Recipient::Submitter])),
            Transition::automatic("signoffs-complete", Stage::NeighborSignoff, Stage::BoardVoting)
                .roles(REVIEWERS)
                .when(Condition::neighbor_signoffs(self.neighbor_signoffs))
                .then(Action::notify(
                    "board-vote-requested",
                    vec![Recipient::Role(Role::BoardMember)],
                ))
                .then(Action::notify("signoffs-complete", vec![Recipient::Submitter])),
        ];
        transitions.extend(self.voting_edges(self.board_votes, vec![]));
        transitions.extend(self.appeal_edges(Stage::BoardVoting));
        transitions.extend(self.construction_edges(vec![]));

        Rule {
            id: "standard".to_string(),
            name: "Standard architectural review".to_string(),
            categories: BTreeSet::from([
                Category::Exterior,
                Category::Fence,
                Category::Solar,
                Category::Other,
            ]),
            transitions,
        }
    }

    fn minor_improvement(&self) -> Rule {
        let mut transitions = vec![
            self.review_on_delay(),
            Transition::manual("approve-minor", Stage::UnderReview, Stage::Approved)
                .roles(REVIEWERS)
                .when(Condition::documents_present())
                .then(Action::notify("request-approved", vec![Recipient::Submitter])),
            Transition::manual("deny-review", Stage::UnderReview, Stage::Denied)
                .roles(STAFF)
                .then(Action::notify("request-denied", vec![Recipient::Submitter])),
            Transition::manual("finish-work", Stage::Approved, Stage::Completed)
                .roles([Role::Homeowner, Role::Management, Role::Admin])
                .then(Action::notify(
                    "request-completed",
                    vec![Recipient::Role(Role::Management)],
                )),
        ];
        transitions.extend(self.appeal_edges(Stage::UnderReview));

        Rule {
            id: "minor-improvement".to_string(),
            name: "Minor improvement (staff approval)".to_string(),
            categories: BTreeSet::from([Category::Landscaping, Category::Paint]),
            transitions,
        }
    }

    fn major_construction(&self) -> Rule {
        let mut transitions = vec![
            self.review_on_delay(),
            Transition::manual("request-signoffs", Stage::UnderReview, Stage::NeighborSignoff)
                .roles(REVIEWERS)
                .when(Condition::documents_present())
                .when(Condition::forms_completed(1))
                .then(Action::notify("signoffs-requested", vec![Recipient::Submitter]))
                .then(Action::remind(
                    "neighbor-signoff-requested",
                    vec![Recipient::Neighbors],
                )),
            Transition::manual("deny-review", Stage::UnderReview, Stage::Denied)
                .roles(STAFF)
                .then(Action::notify("request-denied", vec![Recipient::Submitter])),
            Transition::automatic("signoffs-complete", Stage::NeighborSignoff, Stage::BoardVoting)
                .roles(REVIEWERS)
                .when(Condition::neighbor_signoffs(self.major_neighbor_signoffs))
                .then(Action::notify(
                    "board-vote-requested",
                    vec![Recipient::Role(Role::BoardMember)],
                )),
        ];
        transitions.extend(self.voting_edges(self.board_votes, vec![Condition::custom(PERMIT_ON_FILE)]));
        transitions.extend(self.appeal_edges(Stage::BoardVoting));
        transitions.extend(self.construction_edges(vec![Condition::advisory(
            ConditionKind::FormsCompleted { min: 2 },
        )]));

        Rule {
            id: "major-construction".to_string(),
            name: "Major construction (additions and pools)".to_string(),
            categories: BTreeSet::from([Category::Addition, Category::Pool]),
            transitions,
        }
    }
}
