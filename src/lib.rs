//! Architectural review workflow engine for community associations.
//!
//! A review request moves through a table-driven stage graph (submission, staff review,
//! neighbor sign-off, board vote, construction, inspection), gated by roles and by conditions
//! over the evidence attached to it. The engine validates and applies transitions, records an
//! append-only stage history, and emits notification intents for an external notifier.
//! A background [`Scheduler`] fires time-delayed transitions and sweeps for automatic ones
//! whose conditions have become true.
//!
//! ```ignore
//! let catalog = Arc::new(RuleCatalog::new(StandardRules::default().build()?));
//! let engine = Arc::new(WorkflowEngine::new(
//!     catalog,
//!     Arc::new(InMemoryRequestStore::new()),
//!     PredicateRegistry::standard(),
//!     Arc::new(TracingSink),
//! )?);
//!
//! let scheduler = Arc::new(Scheduler::new(engine.clone(), SchedulerConfig::default(), shutdown));
//! tokio::spawn(scheduler.run());
//!
//! let request = engine.submit(new_request, &homeowner).await?;
//! let outcome = engine.transition(request.id, Stage::UnderReview, &manager, None).await?;
//! ```

pub mod catalog;
pub mod conditions;
pub mod domain;
pub mod engine;
pub mod error;
pub mod manager;
pub mod notify;
pub mod request;
pub mod scheduler;

// Re-export commonly used types
pub use catalog::{RuleCatalog, RuleSet, StandardRules};
pub use conditions::{ConditionEvaluator, Evaluation, PredicateRegistry, Shortfall};
pub use domain::intent::{IntentKind, NotificationIntent};
pub use domain::rule::{Action, Condition, ConditionKind, Recipient, Rule, Transition, TransitionId, Trigger};
pub use engine::{AvailableTransition, RequiredAction, WorkflowEngine};
pub use error::{Result, WorkflowError};
pub use manager::{InMemoryRequestStore, RequestStore};
#[cfg(feature = "postgres")]
pub use manager::postgres::{PoolProvider, PostgresRequestStore, SplitPools, TestDbPools};
pub use notify::{IntentSink, RecordingSink, TracingSink};
pub use request::*;
pub use scheduler::{FireOutcome, Scheduler, SchedulerConfig, SchedulerStats};

/// Get the covenant database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
