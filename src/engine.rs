//! Workflow facade.
//!
//! [`WorkflowEngine`] ties the catalog, the condition evaluator, the executor and the delayed
//! queue together. Every operation that writes a request holds a per-request lease for its
//! whole load-apply-persist cycle; a second operation on the same id fails fast with
//! `TransitionInProgress` instead of waiting.
//!
//! Validation order for a requested transition:
//!
//! 1. rule lookup for the category (`NoApplicableRule`)
//! 2. edge lookup for (current stage, target) (`IllegalTransition`)
//! 3. role check (`Unauthorized`)
//! 4. required conditions (`PreconditionsNotMet`)
//! 5. execute, persist, then register delayed follow-ups out of the new stage

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;

use crate::catalog::{RuleCatalog, RuleSet};
use crate::conditions::{ConditionEvaluator, Evaluation, PredicateRegistry, Shortfall};
use crate::domain::request::{
    Actor, NewReviewRequest, RequestId, ReviewRequest, Role, Stage, TransitionOutcome,
};
use crate::domain::rule::{Rule, Transition, TransitionId, Trigger};
use crate::error::{Result, WorkflowError};
use crate::manager::RequestStore;
use crate::notify::IntentSink;
use crate::scheduler::queue::{DelayedQueue, ScheduledTransition, due_after};

/// Page size used when walking the store during recovery.
const RECOVERY_PAGE_SIZE: usize = 500;

/// A next step the caller may take, for UI affordances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTransition {
    pub transition_id: TransitionId,
    pub to: Stage,
    pub trigger: Trigger,
    /// True if every required condition holds right now.
    pub ready: bool,
    /// Why it is not ready, if it is not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// An outstanding blocker on the way out of the current stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredAction {
    pub transition_id: TransitionId,
    pub to: Stage,
    /// Kind of evidence that is missing, e.g. "neighbor-signoffs".
    pub kind: &'static str,
    /// Same text the gate reports on rejection.
    pub description: String,
    /// Records still missing, for count conditions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outstanding: Option<u32>,
    /// False for advisory conditions.
    pub blocking: bool,
}

/// Marks a request as having a transition in flight until dropped.
pub(crate) struct TransitionLease {
    in_flight: Arc<DashSet<RequestId>>,
    request_id: RequestId,
}

impl Drop for TransitionLease {
    fn drop(&mut self) {
        self.in_flight.remove(&self.request_id);
    }
}

/// Who may take an edge through the public facade.
///
/// The engine's own role is never authorized here; engine-driven edges go through
/// [`WorkflowEngine::advance_automatic`] and the scheduler instead.
fn authorized(transition: &Transition, role: Role) -> bool {
    role != Role::System && transition.permits(role)
}

fn reject(err: WorkflowError) -> WorkflowError {
    metrics::counter!("covenant_transitions_rejected_total", "reason" => err.reason_label())
        .increment(1);
    err
}

/// The workflow engine.
///
/// Construct one per process and share it behind an `Arc`. Nothing in here is global: the
/// catalog, store, predicates and sink are all injected.
pub struct WorkflowEngine<S: RequestStore> {
    catalog: Arc<RuleCatalog>,
    store: Arc<S>,
    evaluator: ConditionEvaluator,
    sink: Arc<dyn IntentSink>,
    timers: Arc<DelayedQueue>,
    in_flight: Arc<DashSet<RequestId>>,
}

impl<S: RequestStore> WorkflowEngine<S> {
    /// Build an engine.
    ///
    /// # Errors
    /// `InvalidCatalog` if the active rule set references a custom predicate that is not in
    /// `predicates`.
    pub fn new(
        catalog: Arc<RuleCatalog>,
        store: Arc<S>,
        predicates: PredicateRegistry,
        sink: Arc<dyn IntentSink>,
    ) -> Result<Self> {
        predicates.check(&catalog.snapshot())?;

        Ok(Self {
            catalog,
            store,
            evaluator: ConditionEvaluator::new(predicates),
            sink,
            timers: Arc::new(DelayedQueue::new()),
            in_flight: Arc::new(DashSet::new()),
        })
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    /// Pending delayed transitions.
    pub fn timers(&self) -> &Arc<DelayedQueue> {
        &self.timers
    }

    /// True while a transition holds the lease for `id`.
    pub fn is_in_flight(&self, id: RequestId) -> bool {
        self.in_flight.contains(&id)
    }

    pub(crate) fn lease(&self, request_id: RequestId) -> Result<TransitionLease> {
        if !self.in_flight.insert(request_id) {
            tracing::debug!(request_id = %request_id, "Transition already in flight");
            return Err(reject(WorkflowError::TransitionInProgress(request_id)));
        }
        Ok(TransitionLease {
            in_flight: self.in_flight.clone(),
            request_id,
        })
    }

    // ========================================================================
    // Pure operations
    // ========================================================================

    /// Validate and execute a transition on a snapshot. No I/O, no lease.
    pub fn apply(
        &self,
        request: &ReviewRequest,
        target: Stage,
        actor: &Actor,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let rule = self.catalog.find_rule(request.category).map_err(reject)?;

        let transition = rule
            .find_transition(request.stage, target)
            .ok_or_else(|| {
                reject(WorkflowError::IllegalTransition {
                    request_id: request.id,
                    from: request.stage,
                    to: target,
                })
            })?;

        if !authorized(transition, actor.role) {
            return Err(reject(WorkflowError::Unauthorized {
                role: actor.role,
                from: request.stage,
                to: target,
            }));
        }

        if let Evaluation::Unsatisfied(shortfall) =
            self.evaluator.evaluate(request, &transition.conditions)
        {
            return Err(reject(WorkflowError::PreconditionsNotMet(
                shortfall.to_string(),
            )));
        }

        request.advance(transition, actor, note, at)
    }

    /// Legal next steps for `role` out of the request's current stage, in catalog order.
    ///
    /// The engine's own role sees only the edges it drives.
    pub fn available_transitions(
        &self,
        request: &ReviewRequest,
        role: Role,
    ) -> Result<Vec<AvailableTransition>> {
        let rule = self.catalog.find_rule(request.category)?;

        Ok(rule
            .outgoing(request.stage)
            .filter(|transition| {
                if role == Role::System {
                    transition.trigger.is_engine_driven()
                } else {
                    authorized(transition, role)
                }
            })
            .map(|transition| {
                let evaluation = self.evaluator.evaluate(request, &transition.conditions);
                AvailableTransition {
                    transition_id: transition.id.clone(),
                    to: transition.to,
                    trigger: transition.trigger,
                    ready: evaluation.is_satisfied(),
                    blocked_by: evaluation.reason(),
                }
            })
            .collect())
    }

    /// Outstanding blockers for every edge out of the current stage.
    ///
    /// Built from the same shortfalls the gate uses. A blocker shared by several edges is
    /// listed once, under the first edge that needs it.
    pub fn required_actions(&self, request: &ReviewRequest) -> Result<Vec<RequiredAction>> {
        let rule = self.catalog.find_rule(request.category)?;
        let mut seen: Vec<Shortfall> = Vec::new();
        let mut actions = Vec::new();

        for transition in rule.outgoing(request.stage) {
            for unmet in self.evaluator.shortfalls(request, &transition.conditions) {
                if seen.contains(&unmet.shortfall) {
                    continue;
                }
                actions.push(RequiredAction {
                    transition_id: transition.id.clone(),
                    to: transition.to,
                    kind: unmet.shortfall.kind(),
                    description: unmet.shortfall.to_string(),
                    outstanding: unmet.shortfall.outstanding(),
                    blocking: unmet.required,
                });
                seen.push(unmet.shortfall);
            }
        }

        Ok(actions)
    }

    // ========================================================================
    // Stored requests
    // ========================================================================

    pub async fn get(&self, id: RequestId) -> Result<ReviewRequest> {
        self.store.get(id).await
    }

    /// Create a request and register its delayed transitions out of `submitted`.
    #[tracing::instrument(skip(self, input, submitter), fields(category = %input.category, submitter = %submitter.id))]
    pub async fn submit(&self, input: NewReviewRequest, submitter: &Actor) -> Result<ReviewRequest> {
        let rule = self.catalog.find_rule(input.category).map_err(reject)?;
        let request = ReviewRequest::submit(input, submitter, Utc::now());

        self.store.create(&request).await?;
        self.schedule_follow_ups(&rule, &request);

        tracing::info!(request_id = %request.id, rule_id = %rule.id, "Review request submitted");
        Ok(request)
    }

    /// Move a stored request to `target`.
    ///
    /// The returned outcome carries the notification intents; dispatching them is up to the
    /// caller.
    #[tracing::instrument(skip(self, actor, note), fields(request_id = %id, to = %target, actor = %actor.id))]
    pub async fn transition(
        &self,
        id: RequestId,
        target: Stage,
        actor: &Actor,
        note: Option<String>,
    ) -> Result<TransitionOutcome> {
        let _lease = self.lease(id)?;
        let request = self.store.get(id).await?;
        let outcome = self.apply(&request, target, actor, note, Utc::now())?;
        self.commit(outcome).await
    }

    /// Auto-advance on behalf of `actor`: apply the first automatic transition out of the
    /// current stage that the actor's role may take and whose conditions hold.
    ///
    /// Returns `Ok(None)` when the stage has no automatic transition at all. When it has some
    /// but none is ready, fails with `PreconditionsNotMet` carrying the first blocker; when the
    /// actor may take none of them, fails with `Unauthorized`.
    #[tracing::instrument(skip(self, actor), fields(request_id = %id, actor = %actor.id))]
    pub async fn advance(&self, id: RequestId, actor: &Actor) -> Result<Option<TransitionOutcome>> {
        self.advance_with(id, actor, |transition| authorized(transition, actor.role))
            .await
            .map_err(|e| match e {
                WorkflowError::Unauthorized { .. } => reject(e),
                other => other,
            })
    }

    /// Auto-advance as the engine itself. Only the scheduler sweep calls this.
    pub(crate) async fn advance_automatic(&self, id: RequestId) -> Result<Option<TransitionOutcome>> {
        self.advance_with(id, &Actor::system(), |_| true).await
    }

    async fn advance_with<F>(
        &self,
        id: RequestId,
        actor: &Actor,
        may_take: F,
    ) -> Result<Option<TransitionOutcome>>
    where
        F: Fn(&Transition) -> bool,
    {
        let _lease = self.lease(id)?;
        let request = self.store.get(id).await?;
        let rule = self.catalog.find_rule(request.category).map_err(reject)?;

        let automatic: Vec<&Transition> = rule
            .outgoing(request.stage)
            .filter(|transition| matches!(transition.trigger, Trigger::Automatic))
            .collect();
        let Some(first) = automatic.first() else {
            return Ok(None);
        };

        let permitted: Vec<&Transition> = automatic
            .iter()
            .copied()
            .filter(|transition| may_take(transition))
            .collect();
        if permitted.is_empty() {
            return Err(WorkflowError::Unauthorized {
                role: actor.role,
                from: request.stage,
                to: first.to,
            });
        }

        let mut blocker = None;
        for transition in permitted {
            match self.evaluator.evaluate(&request, &transition.conditions) {
                Evaluation::Satisfied => {
                    let outcome = request.advance(transition, actor, None, Utc::now())?;
                    return self.commit(outcome).await.map(Some);
                }
                Evaluation::Unsatisfied(shortfall) => {
                    blocker.get_or_insert(shortfall);
                }
            }
        }

        Err(WorkflowError::PreconditionsNotMet(
            blocker.map(|shortfall| shortfall.to_string()).unwrap_or_default(),
        ))
    }

    /// Change a request's evidence (sign-offs, votes, documents, ...) under its lease.
    ///
    /// The closure may not touch id, category, stage or history; those only change through
    /// transitions.
    pub async fn update_evidence<F>(&self, id: RequestId, update: F) -> Result<ReviewRequest>
    where
        F: FnOnce(&mut ReviewRequest) + Send,
    {
        let _lease = self.lease(id)?;
        let current = self.store.get(id).await?;

        let mut updated = current.clone();
        update(&mut updated);

        if updated.id != current.id
            || updated.category != current.category
            || updated.stage != current.stage
            || updated.history != current.history
            || updated.created_at != current.created_at
        {
            return Err(WorkflowError::ValidationError(
                "evidence updates may not change id, category, stage or history".to_string(),
            ));
        }

        if updated == current {
            return Ok(current);
        }

        updated.updated_at = Utc::now();
        self.store.persist(&updated).await?;
        tracing::debug!(request_id = %id, "Evidence updated");
        Ok(updated)
    }

    /// Remove a request and cancel all of its timers.
    pub async fn delete(&self, id: RequestId) -> Result<()> {
        let _lease = self.lease(id)?;
        self.store.delete(id).await?;
        let cancelled = self.timers.cancel_request(id);
        tracing::info!(request_id = %id, cancelled_timers = cancelled, "Review request deleted");
        Ok(())
    }

    /// Validate a new rule set and swap it in.
    pub fn reload_catalog(&self, rule_set: RuleSet) -> Result<()> {
        self.evaluator.predicates().check(&rule_set)?;
        self.catalog.reload(rule_set);
        Ok(())
    }

    /// Re-register delayed transitions for every live request, e.g. after a restart.
    ///
    /// Due times are computed from when the request entered its current stage, so overdue
    /// timers fire on the scheduler's next poll. Returns how many were registered.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut after = None;
        let mut registered = 0;

        loop {
            let page = self.store.list_active(after, RECOVERY_PAGE_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            for request in &page {
                match self.catalog.find_rule(request.category) {
                    Ok(rule) => registered += self.schedule_follow_ups(&rule, request),
                    Err(e) => {
                        tracing::error!(request_id = %request.id, error = %e, "Skipping recovery");
                    }
                }
            }

            if page.len() < RECOVERY_PAGE_SIZE {
                break;
            }
        }

        tracing::info!(registered, "Recovered delayed transitions");
        Ok(registered)
    }

    // ========================================================================
    // Internals shared with the scheduler
    // ========================================================================

    /// Persist an executed transition and rearm timers for the new stage. Caller holds the
    /// lease.
    pub(crate) async fn commit(&self, outcome: TransitionOutcome) -> Result<TransitionOutcome> {
        self.store.persist(&outcome.request).await?;

        let request_id = outcome.request.id;
        self.timers.cancel_request(request_id);

        let rule = self.catalog.find_rule(outcome.request.category);
        let trigger = rule
            .as_ref()
            .ok()
            .and_then(|rule| rule.transition(&outcome.transition_id))
            .map_or("unknown", |transition| transition.trigger.as_str());
        let rule_id = rule
            .as_ref()
            .map_or_else(|_| "unknown".to_string(), |rule| rule.id.clone());

        metrics::counter!(
            "covenant_transitions_total",
            "rule" => rule_id.clone(),
            "to" => outcome.to.as_str(),
            "trigger" => trigger
        )
        .increment(1);

        if let Ok(rule) = &rule {
            self.schedule_follow_ups(rule, &outcome.request);
        }

        tracing::info!(
            request_id = %request_id,
            rule_id = %rule_id,
            transition_id = %outcome.transition_id,
            from = %outcome.from,
            to = %outcome.to,
            trigger,
            intents = outcome.intents.len(),
            "Transition applied"
        );

        Ok(outcome)
    }

    /// Hand intents of an engine-driven transition to the sink. Delivery failures are logged,
    /// never propagated: the transition itself has already been persisted.
    pub(crate) async fn dispatch(&self, outcome: &TransitionOutcome) {
        if outcome.intents.is_empty() {
            return;
        }
        if let Err(e) = self
            .sink
            .dispatch(outcome.request.id, &outcome.intents)
            .await
        {
            tracing::error!(
                request_id = %outcome.request.id,
                error = %e,
                "Failed to dispatch notification intents"
            );
        }
    }

    /// Register every delayed edge out of the request's current stage. Returns how many.
    fn schedule_follow_ups(&self, rule: &Rule, request: &ReviewRequest) -> usize {
        let entered_at = request.stage_entered_at();
        rule.outgoing(request.stage)
            .filter_map(|transition| {
                transition.trigger.delay().map(|delay| {
                    ScheduledTransition::new(request.id, transition, due_after(entered_at, delay))
                })
            })
            .map(|entry| self.timers.schedule(entry))
            .count()
    }
}
