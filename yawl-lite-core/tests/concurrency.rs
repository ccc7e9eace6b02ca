//! Concurrent requests: one case serializes them, different cases progress
//! in parallel.

mod common;

use common::{engine_with, item, s1};
use std::collections::{HashMap, HashSet};
use yawl_lite_core::{
    CaseData, CaseId, CaseStatus, Engine, EngineError, EngineEvent, WorkItemId, WorkItemState,
};

fn illegal_after(err: &EngineError, state: WorkItemState) -> bool {
    matches!(err, EngineError::IllegalTransition { from, .. } if *from == state)
}

/// Terminal states each work item reached, from the event stream.
fn outcomes(events: &[EngineEvent]) -> HashMap<WorkItemId, HashSet<WorkItemState>> {
    let mut seen: HashMap<WorkItemId, HashSet<WorkItemState>> = HashMap::new();
    for event in events {
        if let EngineEvent::WorkItemStateChanged {
            work_item_id, to, ..
        } = event
        {
            if to.is_terminal() {
                seen.entry(*work_item_id).or_default().insert(*to);
            }
        }
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completes_racing_a_case_cancel_stay_consistent() {
    for _ in 0..20 {
        let engine = engine_with(vec![s1()]).await;
        let mut rx = engine.subscribe();
        let case_id = engine.start_case("s1", CaseData::new()).await.unwrap();
        let a = item(&engine, case_id, "A").await;
        engine.complete_work_item(a, CaseData::new()).await.unwrap();
        let b = item(&engine, case_id, "B").await;
        let c = item(&engine, case_id, "C").await;

        let (done_b, done_c, cancelled) = tokio::join!(
            engine.complete_work_item(b, CaseData::new()),
            engine.complete_work_item(c, CaseData::new()),
            engine.cancel_case(case_id),
        );
        cancelled.unwrap();
        for result in [done_b, done_c] {
            if let Err(err) = result {
                assert!(illegal_after(&err, WorkItemState::Cancelled), "unexpected {err:?}");
            }
        }

        let snap = engine.get_case_state(case_id).await.unwrap();
        assert!(matches!(snap.status, CaseStatus::Cancelled { .. }));
        assert_eq!(snap.total_tokens(), 0);
        assert!(snap.live_work_items.is_empty());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for (id, states) in outcomes(&events) {
            assert_eq!(states.len(), 1, "{id} ended as {states:?}");
        }
        let closes = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(closes, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_of_two_identical_completes_wins() {
    let engine = engine_with(vec![s1()]).await;
    let case_id = engine.start_case("s1", CaseData::new()).await.unwrap();
    let a = item(&engine, case_id, "A").await;

    let (first, second) = tokio::join!(
        engine.complete_work_item(a, CaseData::new()),
        engine.complete_work_item(a, CaseData::new()),
    );
    let (won, lost): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
    assert_eq!(won.len(), 1);
    let err = lost.into_iter().next().unwrap().unwrap_err();
    assert!(illegal_after(&err, WorkItemState::Completed), "unexpected {err:?}");

    let snap = engine.get_case_state(case_id).await.unwrap();
    assert_eq!(snap.tokens_at("A->B"), 1);
    assert_eq!(snap.tokens_at("A->C"), 1);
    assert_eq!(snap.total_tokens(), 2);
}

async fn drive_to_completion(engine: Engine) -> CaseId {
    let case_id = engine.start_case("s1", CaseData::new()).await.unwrap();
    for task in ["A", "B", "C", "D"] {
        let id = item(&engine, case_id, task).await;
        engine.complete_work_item(id, CaseData::new()).await.unwrap();
        tokio::task::yield_now().await;
    }
    case_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_cases_progress_in_parallel() {
    let engine = engine_with(vec![s1()]).await;
    let handles: Vec<_> = (0..32)
        .map(|_| tokio::spawn(drive_to_completion(engine.clone())))
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 32);
    for case_id in ids {
        let snap = engine.get_case_state(case_id).await.unwrap();
        assert!(matches!(snap.status, CaseStatus::Completed { .. }));
        assert_eq!(snap.tokens_at("o"), 1);
        assert_eq!(snap.total_tokens(), 1);
    }
    assert!(engine.case_ids().await.is_empty(), "finished cases are released");
}
