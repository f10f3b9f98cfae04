//! Condition evaluation.
//!
//! Every condition check produces either nothing (the condition holds) or a [`Shortfall`]
//! describing what is missing. Both the transition gate and the required-actions summary are
//! built from the same shortfalls, so the reason an actor sees on rejection is the same text
//! the UI lists as outstanding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::catalog::{PERMIT_ON_FILE, RuleSet};
use crate::domain::request::ReviewRequest;
use crate::domain::rule::{Condition, ConditionKind};
use crate::error::{Result, WorkflowError};

/// A named custom check over the full request snapshot. Must be pure.
pub type PredicateFn = Arc<dyn Fn(&ReviewRequest) -> bool + Send + Sync>;

/// Custom predicates available to `custom` conditions, by name.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, PredicateFn>,
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("PredicateRegistry")
            .field("predicates", &names)
            .finish()
    }
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in predicates (`permit-on-file`).
    pub fn standard() -> Self {
        Self::new().with(PERMIT_ON_FILE, |request: &ReviewRequest| {
            request.documents.iter().any(|doc| {
                doc.kind
                    .as_deref()
                    .is_some_and(|kind| kind.eq_ignore_ascii_case("permit"))
            })
        })
    }

    /// Register (or replace) a predicate.
    pub fn with<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ReviewRequest) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PredicateFn> {
        self.predicates.get(name)
    }

    /// Fail if the rule set references a predicate this registry does not have.
    pub fn check(&self, rule_set: &RuleSet) -> Result<()> {
        let missing: Vec<String> = rule_set
            .custom_predicates()
            .into_iter()
            .filter(|name| !self.contains(name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::InvalidCatalog(format!(
                "unregistered custom predicate(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// What a request is missing for one condition to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shortfall {
    NeighborSignoffs { required: u32, have: u32 },
    BoardVotes { required: u32, have: u32 },
    FormsCompleted { required: u32, have: u32 },
    InspectionPassed,
    DocumentsPresent,
    Custom { name: String },
}

impl Shortfall {
    /// Stable label for the kind of blocker, e.g. for UI icons.
    pub fn kind(&self) -> &'static str {
        match self {
            Shortfall::NeighborSignoffs { .. } => "neighbor-signoffs",
            Shortfall::BoardVotes { .. } => "board-votes",
            Shortfall::FormsCompleted { .. } => "forms-completed",
            Shortfall::InspectionPassed => "inspection-passed",
            Shortfall::DocumentsPresent => "documents-present",
            Shortfall::Custom { .. } => "custom",
        }
    }

    /// How many more records are needed, for count conditions.
    pub fn outstanding(&self) -> Option<u32> {
        match self {
            Shortfall::NeighborSignoffs { required, have }
            | Shortfall::BoardVotes { required, have }
            | Shortfall::FormsCompleted { required, have } => Some(required.saturating_sub(*have)),
            _ => None,
        }
    }
}

fn plural(n: u32, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{} {}", n, one)
    } else {
        format!("{} {}", n, many)
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::NeighborSignoffs { required, have } => write!(
                f,
                "requires {}, have {}",
                plural(*required, "neighbor sign-off", "neighbor sign-offs"),
                have
            ),
            Shortfall::BoardVotes { required, have } => write!(
                f,
                "requires {}, have {}",
                plural(*required, "board approval vote", "board approval votes"),
                have
            ),
            Shortfall::FormsCompleted { required, have } => write!(
                f,
                "requires {}, have {}",
                plural(*required, "completed form", "completed forms"),
                have
            ),
            Shortfall::InspectionPassed => f.write_str("requires a passed inspection"),
            Shortfall::DocumentsPresent => f.write_str("requires at least one document"),
            Shortfall::Custom { name } => write!(f, "requires custom check '{}' to pass", name),
        }
    }
}

/// Result of gating a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Satisfied,
    /// The first required condition that failed, in declaration order.
    Unsatisfied(Shortfall),
}

impl Evaluation {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Evaluation::Satisfied)
    }

    /// Human-readable reason, if unsatisfied.
    pub fn reason(&self) -> Option<String> {
        match self {
            Evaluation::Satisfied => None,
            Evaluation::Unsatisfied(shortfall) => Some(shortfall.to_string()),
        }
    }
}

/// One condition that does not currently hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmet {
    pub shortfall: Shortfall,
    /// False for advisory conditions.
    pub required: bool,
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Read-only evaluator. Safe to share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    predicates: PredicateRegistry,
}

impl ConditionEvaluator {
    pub fn new(predicates: PredicateRegistry) -> Self {
        Self { predicates }
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    /// Check one condition. `None` means it holds.
    pub fn check(&self, request: &ReviewRequest, condition: &Condition) -> Option<Shortfall> {
        match &condition.kind {
            ConditionKind::NeighborSignoffs { min } => {
                let have = count(request.approved_signoffs());
                (have < *min).then_some(Shortfall::NeighborSignoffs {
                    required: *min,
                    have,
                })
            }
            ConditionKind::BoardVotes { min } => {
                let have = count(request.approving_votes());
                (have < *min).then_some(Shortfall::BoardVotes {
                    required: *min,
                    have,
                })
            }
            ConditionKind::FormsCompleted { min } => {
                let have = count(request.completed_forms());
                (have < *min).then_some(Shortfall::FormsCompleted {
                    required: *min,
                    have,
                })
            }
            ConditionKind::InspectionPassed => {
                (!request.has_passed_inspection()).then_some(Shortfall::InspectionPassed)
            }
            ConditionKind::DocumentsPresent => {
                request.documents.is_empty().then_some(Shortfall::DocumentsPresent)
            }
            ConditionKind::Custom { name } => {
                // An unknown predicate never passes.
                let passed = self
                    .predicates
                    .get(name)
                    .is_some_and(|predicate| predicate(request));
                (!passed).then(|| Shortfall::Custom { name: name.clone() })
            }
        }
    }

    /// Gate a transition: stops at the first required condition that fails.
    pub fn evaluate(&self, request: &ReviewRequest, conditions: &[Condition]) -> Evaluation {
        conditions
            .iter()
            .filter(|condition| condition.required)
            .find_map(|condition| self.check(request, condition))
            .map_or(Evaluation::Satisfied, Evaluation::Unsatisfied)
    }

    /// Every condition that does not hold, required and advisory, in declaration order.
    pub fn shortfalls(&self, request: &ReviewRequest, conditions: &[Condition]) -> Vec<Unmet> {
        conditions
            .iter()
            .filter_map(|condition| {
                self.check(request, condition).map(|shortfall| Unmet {
                    shortfall,
                    required: condition.required,
                })
            })
            .collect()
    }
}
