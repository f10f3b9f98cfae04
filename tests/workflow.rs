use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use covenant::{
    Actor, BoardVote, Category, Document, FireOutcome, Inspection, InspectionStatus,
    InMemoryRequestStore, NeighborSignoff, NewReviewRequest, PredicateRegistry, RecordingSink,
    RequestId, RequestStore, ReviewRequest, Role, RuleCatalog, Scheduler, SchedulerConfig,
    SignoffStatus, Stage, StandardRules, Transition, VoteValue, WorkflowEngine, WorkflowError,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn homeowner() -> Actor {
    Actor::new("owner-7", Role::Homeowner)
}

fn captain() -> Actor {
    Actor::new("cap-2", Role::Captain)
}

fn manager() -> Actor {
    Actor::new("mgr-1", Role::Management)
}

fn fence_request() -> NewReviewRequest {
    NewReviewRequest {
        category: Category::Fence,
        title: "Replace rear fence".to_string(),
        description: "6ft cedar, same footprint".to_string(),
        documents: vec![Document {
            id: Uuid::new_v4(),
            name: "site-plan.pdf".to_string(),
            kind: Some("site-plan".to_string()),
            uploaded_by: "owner-7".to_string(),
            uploaded_at: Utc::now(),
        }],
    }
}

fn signoff(neighbor: &str) -> NeighborSignoff {
    NeighborSignoff {
        neighbor_id: neighbor.to_string(),
        address: Some("12 Elm St".to_string()),
        status: SignoffStatus::Approved,
        comment: None,
        recorded_at: Utc::now(),
    }
}

fn vote(voter: &str, value: VoteValue) -> BoardVote {
    BoardVote {
        voter_id: voter.to_string(),
        value,
        cast_at: Utc::now(),
    }
}

fn build<S: RequestStore + 'static>(
    store: Arc<S>,
) -> (Arc<Scheduler<S>>, RecordingSink) {
    let sink = RecordingSink::new();
    let engine = WorkflowEngine::new(
        Arc::new(RuleCatalog::new(StandardRules::default().build().unwrap())),
        store,
        PredicateRegistry::standard(),
        Arc::new(sink.clone()),
    )
    .unwrap();
    let config = SchedulerConfig {
        status_log_interval_ms: None,
        ..Default::default()
    };
    let scheduler = Scheduler::new(Arc::new(engine), config, CancellationToken::new());
    (Arc::new(scheduler), sink)
}

fn setup() -> (Arc<Scheduler<InMemoryRequestStore>>, RecordingSink) {
    build(Arc::new(InMemoryRequestStore::new()))
}

/// Submit a fence request and walk it into `neighbor-signoff`.
async fn in_signoff<S: RequestStore + 'static>(scheduler: &Scheduler<S>) -> RequestId {
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    engine
        .transition(request.id, Stage::UnderReview, &manager(), None)
        .await
        .unwrap();
    engine
        .transition(request.id, Stage::NeighborSignoff, &captain(), None)
        .await
        .unwrap();
    request.id
}

#[test_log::test(tokio::test)]
async fn test_scenario_a_missing_signoff_blocks_board_vote() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    engine
        .update_evidence(id, |r| r.signoffs.push(signoff("n-1")))
        .await
        .unwrap();

    let err = engine
        .transition(id, Stage::BoardVoting, &captain(), None)
        .await
        .unwrap_err();
    match &err {
        WorkflowError::PreconditionsNotMet(reason) => {
            assert!(reason.contains('2'), "reason: {}", reason);
            assert!(reason.contains('1'), "reason: {}", reason);
            assert_eq!(reason, "requires 2 neighbor sign-offs, have 1");
        }
        other => panic!("expected PreconditionsNotMet, got {:?}", other),
    }
    assert!(!err.is_retryable());

    // Auto-advance reports the same blocker.
    match engine.advance(id, &captain()).await {
        Err(WorkflowError::PreconditionsNotMet(reason)) => {
            assert_eq!(reason, "requires 2 neighbor sign-offs, have 1");
        }
        other => panic!("expected PreconditionsNotMet, got {:?}", other),
    }
    assert_eq!(scheduler.sweep().await.unwrap(), 0);
    assert_eq!(engine.get(id).await.unwrap().stage, Stage::NeighborSignoff);
}

#[test_log::test(tokio::test)]
async fn test_scenario_b_second_signoff_lets_sweep_advance() {
    let (scheduler, sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    engine
        .update_evidence(id, |r| r.signoffs.push(signoff("n-1")))
        .await
        .unwrap();
    let before = engine.get(id).await.unwrap();

    engine
        .update_evidence(id, |r| r.signoffs.push(signoff("n-2")))
        .await
        .unwrap();
    assert_eq!(scheduler.sweep().await.unwrap(), 1);

    let after = engine.get(id).await.unwrap();
    assert_eq!(after.stage, Stage::BoardVoting);
    assert_eq!(after.history.len(), before.history.len() + 1);
    assert_eq!(after.history[..before.history.len()], before.history[..]);
    assert_eq!(
        after.history.iter().map(|e| e.stage).collect::<Vec<_>>(),
        vec![
            Stage::Submitted,
            Stage::UnderReview,
            Stage::NeighborSignoff,
            Stage::BoardVoting
        ]
    );

    let templates = sink.templates_for(id);
    assert_eq!(templates, vec!["board-vote-requested", "signoffs-complete"]);
    let batch = &sink.dispatched()[0].intents;
    assert_eq!(batch[0].targets, vec!["role:board-member"]);
    assert_eq!(batch[1].targets, vec!["owner-7"]);
}

#[test_log::test(tokio::test)]
async fn test_scenario_c_homeowner_cannot_fast_track() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    engine
        .transition(request.id, Stage::UnderReview, &manager(), None)
        .await
        .unwrap();
    let before = engine.get(request.id).await.unwrap();

    let err = engine
        .transition(request.id, Stage::BoardVoting, &homeowner(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Unauthorized {
            role: Role::Homeowner,
            from: Stage::UnderReview,
            to: Stage::BoardVoting,
        }
    ));
    assert_eq!(engine.get(request.id).await.unwrap(), before);

    // Captains and management may take the same edge.
    let outcome = engine
        .transition(request.id, Stage::BoardVoting, &captain(), None)
        .await
        .unwrap();
    assert_eq!(outcome.request.stage, Stage::BoardVoting);
}

#[test_log::test(tokio::test)]
async fn test_engine_role_cannot_be_claimed_by_callers() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();

    assert!("system".parse::<Role>().is_err());

    // Constructed directly, the role still buys nothing on the delayed review edge.
    let impostor = Actor::new("owner-claims-system", Role::System);
    let err = engine
        .transition(request.id, Stage::UnderReview, &impostor, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Unauthorized {
            role: Role::System,
            from: Stage::Submitted,
            to: Stage::UnderReview,
        }
    ));
    assert_eq!(engine.get(request.id).await.unwrap(), request);
    assert_eq!(engine.timers().pending_for(request.id).len(), 1);
}

/// Store whose first `persist` waits until the test releases it.
struct GatedStore {
    inner: InMemoryRequestStore,
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl RequestStore for GatedStore {
    async fn create(&self, request: &ReviewRequest) -> covenant::Result<()> {
        self.inner.create(request).await
    }

    async fn get(&self, id: RequestId) -> covenant::Result<ReviewRequest> {
        self.inner.get(id).await
    }

    async fn persist(&self, request: &ReviewRequest) -> covenant::Result<()> {
        let release = self.release.lock().take();
        if let Some(release) = release {
            let entered = self.entered.lock().take();
            if let Some(entered) = entered {
                let _ = entered.send(());
            }
            let _ = release.await;
        }
        self.inner.persist(request).await
    }

    async fn delete(&self, id: RequestId) -> covenant::Result<()> {
        self.inner.delete(id).await
    }

    async fn list_active(
        &self,
        after: Option<RequestId>,
        limit: usize,
    ) -> covenant::Result<Vec<ReviewRequest>> {
        self.inner.list_active(after, limit).await
    }
}

#[test_log::test(tokio::test)]
async fn test_scenario_d_concurrent_transitions_fail_fast() {
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let store = Arc::new(GatedStore {
        inner: InMemoryRequestStore::new(),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let (scheduler, _sink) = build(store);
    let engine = scheduler.engine().clone();

    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    let id = request.id;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .transition(id, Stage::UnderReview, &manager(), None)
                .await
        })
    };
    // The first call now holds the lease and is parked inside persist.
    entered_rx.await.unwrap();
    assert!(engine.is_in_flight(id));

    let second = engine
        .transition(id, Stage::UnderReview, &captain(), None)
        .await;
    let err = second.unwrap_err();
    assert!(matches!(err, WorkflowError::TransitionInProgress(busy) if busy == id));
    assert!(err.is_retryable());

    release_tx.send(()).unwrap();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.request.stage, Stage::UnderReview);
    assert!(!engine.is_in_flight(id));

    let stored = engine.get(id).await.unwrap();
    assert_eq!(stored.history.len(), 2);
    assert_eq!(stored.history[1].entered_by, "mgr-1");
}

#[test_log::test(tokio::test)]
async fn test_scenario_e_stale_timer_is_a_logged_noop() {
    let (scheduler, sink) = setup();
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    assert_eq!(engine.timers().pending_for(request.id).len(), 1);

    // Moved by hand before the 30 minute timer; the pending timer is cancelled.
    engine
        .transition(request.id, Stage::UnderReview, &manager(), None)
        .await
        .unwrap();
    engine
        .transition(request.id, Stage::Denied, &manager(), Some("Exceeds height limit".into()))
        .await
        .unwrap();
    assert!(engine.timers().pending_for(request.id).is_empty());
    let before = engine.get(request.id).await.unwrap();

    // A timer that escaped cancellation (e.g. re-armed while the lease was held) still fires.
    let begin_review = Transition::delayed(
        "begin-review",
        Stage::Submitted,
        Stage::UnderReview,
        30 * 60 * 1000,
    );
    let due = request.created_at + TimeDelta::minutes(30);
    scheduler.schedule_at(request.id, &begin_review, due);

    let report = scheduler.tick(due).await.unwrap();
    assert_eq!(report.fired.len(), 1);
    assert_eq!(
        report.fired[0].1,
        FireOutcome::Stale {
            current: Stage::Denied
        }
    );

    assert_eq!(engine.get(request.id).await.unwrap(), before);
    assert!(engine.timers().is_empty());
    assert_eq!(scheduler.stats().stale_skipped, 1);
    assert!(sink.templates_for(request.id).is_empty());
}

#[test_log::test(tokio::test)]
async fn test_full_lifecycle_keeps_history_consistent() {
    let (scheduler, sink) = setup();
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    let id = request.id;
    let mut previous = engine.get(id).await.unwrap();

    let check = |previous: &ReviewRequest, current: &ReviewRequest| {
        assert!(current.is_consistent());
        assert_eq!(current.history.len(), previous.history.len() + 1);
        assert_eq!(current.history[..previous.history.len()], previous.history[..]);
    };

    // Delayed review after 30 minutes.
    scheduler
        .tick(request.created_at + TimeDelta::minutes(30))
        .await
        .unwrap();
    let current = engine.get(id).await.unwrap();
    assert_eq!(current.stage, Stage::UnderReview);
    check(&previous, &current);
    previous = current;

    let outcome = engine
        .transition(id, Stage::NeighborSignoff, &captain(), None)
        .await
        .unwrap();
    check(&previous, &outcome.request);
    previous = outcome.request;

    engine
        .update_evidence(id, |r| {
            r.signoffs.push(signoff("n-1"));
            r.signoffs.push(signoff("n-2"));
        })
        .await
        .unwrap();
    assert_eq!(scheduler.sweep().await.unwrap(), 1);
    let current = engine.get(id).await.unwrap();
    check(&previous, &current);
    previous = current;

    engine
        .update_evidence(id, |r| {
            r.votes.push(vote("b-1", VoteValue::Approve));
            r.votes.push(vote("b-2", VoteValue::Deny));
            r.votes.push(vote("b-3", VoteValue::Approve));
        })
        .await
        .unwrap();
    assert_eq!(scheduler.sweep().await.unwrap(), 0);
    engine
        .update_evidence(id, |r| r.votes.push(vote("b-4", VoteValue::Approve)))
        .await
        .unwrap();
    assert_eq!(scheduler.sweep().await.unwrap(), 1);
    let current = engine.get(id).await.unwrap();
    assert_eq!(current.stage, Stage::Approved);
    check(&previous, &current);
    previous = current;

    for target in [Stage::InProgress, Stage::InspectionRequired] {
        let outcome = engine.transition(id, target, &homeowner(), None).await.unwrap();
        check(&previous, &outcome.request);
        previous = outcome.request;
    }

    engine
        .update_evidence(id, |r| {
            r.inspections.push(Inspection {
                inspector: "insp-1".to_string(),
                status: InspectionStatus::Passed,
                notes: Some("Matches plan".to_string()),
                inspected_at: Some(Utc::now()),
            })
        })
        .await
        .unwrap();
    assert_eq!(scheduler.sweep().await.unwrap(), 1);
    let current = engine.get(id).await.unwrap();
    assert_eq!(current.stage, Stage::Completed);
    assert!(current.is_terminal());
    check(&previous, &current);

    // Completed requests drop out of the sweep and accept nothing further.
    assert!(engine.available_transitions(&current, Role::Admin).unwrap().is_empty());
    assert!(engine.required_actions(&current).unwrap().is_empty());
    let batches: Vec<Vec<String>> = sink
        .dispatched()
        .iter()
        .filter(|batch| batch.request_id == id)
        .map(|batch| batch.intents.iter().map(|i| i.template.clone()).collect())
        .collect();
    assert!(batches.contains(&vec!["request-approved".to_string()]));
}

#[test_log::test(tokio::test)]
async fn test_appeal_reopens_denied_request() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let request = engine.submit(fence_request(), &homeowner()).await.unwrap();
    let id = request.id;
    engine
        .transition(id, Stage::UnderReview, &manager(), None)
        .await
        .unwrap();
    engine
        .transition(id, Stage::BoardVoting, &captain(), None)
        .await
        .unwrap();
    engine
        .transition(id, Stage::Denied, &Actor::new("b-1", Role::BoardMember), None)
        .await
        .unwrap();

    // Terminal: only the explicitly modelled appeal edge is open.
    let denied = engine.get(id).await.unwrap();
    let available = engine
        .available_transitions(&denied, Role::Homeowner)
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].to, Stage::AppealPending);
    assert!(matches!(
        engine.transition(id, Stage::Approved, &manager(), None).await,
        Err(WorkflowError::IllegalTransition { .. })
    ));

    engine
        .update_evidence(id, |r| {
            r.appeals.push(covenant::Appeal {
                filed_by: "owner-7".to_string(),
                reason: "Neighbor has the same fence".to_string(),
                filed_at: Utc::now(),
            })
        })
        .await
        .unwrap();
    let appealed = engine
        .transition(id, Stage::AppealPending, &homeowner(), None)
        .await
        .unwrap();
    assert_eq!(appealed.intents[0].targets, vec!["role:management"]);

    let reheard = engine
        .transition(id, Stage::BoardVoting, &manager(), Some("Rehearing".to_string()))
        .await
        .unwrap();
    assert_eq!(reheard.request.stage, Stage::BoardVoting);
    assert_eq!(
        reheard.request.history.last().unwrap().note.as_deref(),
        Some("Rehearing")
    );
}

#[test_log::test(tokio::test)]
async fn test_illegal_transition_leaves_stored_request_unchanged() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    let before = serde_json::to_string(&engine.get(id).await.unwrap()).unwrap();

    for target in [
        Stage::Submitted,
        Stage::UnderReview,
        Stage::Approved,
        Stage::Completed,
        Stage::InspectionFailed,
    ] {
        let err = engine
            .transition(id, target, &Actor::new("admin", Role::Admin), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::IllegalTransition { .. }));
    }

    let after = serde_json::to_string(&engine.get(id).await.unwrap()).unwrap();
    assert_eq!(before, after);
}

#[test_log::test(tokio::test)]
async fn test_available_transitions_is_idempotent() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    let request = engine.get(id).await.unwrap();

    for role in [Role::Homeowner, Role::Captain, Role::Management, Role::System] {
        let first = engine.available_transitions(&request, role).unwrap();
        let second = engine.available_transitions(&request, role).unwrap();
        assert_eq!(first, second);
    }
    assert_eq!(engine.get(id).await.unwrap(), request);
}

#[test_log::test(tokio::test)]
async fn test_round_trip_gives_identical_transition() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    engine
        .update_evidence(id, |r| {
            r.signoffs.push(signoff("n-1"));
            r.signoffs.push(signoff("n-2"));
        })
        .await
        .unwrap();
    let original = engine.get(id).await.unwrap();

    let json = serde_json::to_string(&original).unwrap();
    let restored: ReviewRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, original);

    let at = original.updated_at + TimeDelta::minutes(5);
    let a = engine
        .apply(&original, Stage::BoardVoting, &captain(), Some("ok".into()), at)
        .unwrap();
    let b = engine
        .apply(&restored, Stage::BoardVoting, &captain(), Some("ok".into()), at)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a.request).unwrap(),
        serde_json::to_string(&b.request).unwrap()
    );
}

#[test_log::test(tokio::test)]
async fn test_hot_reload_applies_to_next_lookup() {
    let (scheduler, _sink) = setup();
    let engine = scheduler.engine();
    let id = in_signoff(&scheduler).await;
    engine
        .update_evidence(id, |r| r.signoffs.push(signoff("n-1")))
        .await
        .unwrap();

    // Lower the sign-off threshold to one.
    let relaxed = StandardRules {
        neighbor_signoffs: 1,
        ..Default::default()
    };
    engine.reload_catalog(relaxed.build().unwrap()).unwrap();

    assert_eq!(scheduler.sweep().await.unwrap(), 1);
    assert_eq!(engine.get(id).await.unwrap().stage, Stage::BoardVoting);
}

#[test_log::test(tokio::test)]
async fn test_recover_rebuilds_timers_after_restart() {
    let store = Arc::new(InMemoryRequestStore::new());
    let (before_restart, _sink) = build(store.clone());
    let request = before_restart
        .engine()
        .submit(fence_request(), &homeowner())
        .await
        .unwrap();
    drop(before_restart);

    let (after_restart, _sink) = build(store);
    assert!(after_restart.engine().timers().is_empty());
    assert_eq!(after_restart.engine().recover().await.unwrap(), 1);

    let report = after_restart
        .tick(request.created_at + TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(
        report.fired[0].1,
        FireOutcome::Applied {
            to: Stage::UnderReview
        }
    );
}
