//! Snapshots, the case store, the event stream and deadlock reporting.

mod common;

use async_trait::async_trait;
use common::{data, drain, engine_with, init_tracing, item, s1, single};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use yawl_lite_core::{
    CaseData, CaseId, CaseState, CaseStatus, CaseStore, Engine, EngineConfig, EngineError,
    EngineEvent, EngineResult, MemoryCaseStore, Specification, SpecificationDto,
    SpecificationLoader,
};

#[tokio::test]
async fn snapshot_restores_into_another_engine() {
    let first = engine_with(vec![s1()]).await;
    let case_id = first
        .start_case("s1", data(json!({"customer": "acme"})))
        .await
        .unwrap();
    let a = item(&first, case_id, "A").await;
    first.complete_work_item(a, CaseData::new()).await.unwrap();
    let b = item(&first, case_id, "B").await;
    first.complete_work_item(b, CaseData::new()).await.unwrap();

    let bytes = first.snapshot_case(case_id).await.unwrap();
    let before = first.get_case_state(case_id).await.unwrap();

    let second = engine_with(vec![s1()]).await;
    assert_eq!(second.restore_case(&bytes).await.unwrap(), case_id);
    let after = second.get_case_state(case_id).await.unwrap();
    assert_eq!(after, before);

    let err = second.restore_case(&bytes).await.unwrap_err();
    assert!(matches!(err, EngineError::CaseAlreadyLoaded { .. }));

    // The restored case keeps running where it left off.
    let c = item(&second, case_id, "C").await;
    second.complete_work_item(c, CaseData::new()).await.unwrap();
    let d = item(&second, case_id, "D").await;
    second.complete_work_item(d, CaseData::new()).await.unwrap();
    let snap = second.get_case_state(case_id).await.unwrap();
    assert!(matches!(snap.status, CaseStatus::Completed { .. }));
    assert_eq!(snap.data.get("customer"), Some(&json!("acme")));
}

#[tokio::test]
async fn restore_needs_the_specification() {
    let first = engine_with(vec![single()]).await;
    let case_id = first.start_case("single", CaseData::new()).await.unwrap();
    let bytes = first.snapshot_case(case_id).await.unwrap();

    let empty = engine_with(vec![]).await;
    let err = empty.restore_case(&bytes).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownSpecification { .. }));

    let err = empty.restore_case(b"not json").await.unwrap_err();
    assert!(matches!(err, EngineError::Serialization(_)));
}

#[tokio::test]
async fn store_keeps_the_event_log_in_order() {
    init_tracing();
    let store: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let engine = Engine::builder().store(store.clone()).build();
    engine.register_specification(single()).await;

    let case_id = engine.start_case("single", CaseData::new()).await.unwrap();
    let a = item(&engine, case_id, "A").await;
    engine.complete_work_item(a, CaseData::new()).await.unwrap();

    let log = engine.read_events(case_id, 0).await.unwrap();
    let seqs: Vec<u64> = log.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, (0..log.len() as u64).collect::<Vec<_>>());
    assert!(matches!(log.first(), Some((0, EngineEvent::CaseStarted { .. }))));
    assert!(matches!(log.last(), Some((_, EngineEvent::CaseCompleted { .. }))));
    assert!(log.iter().all(|(_, e)| e.case_id() == case_id));

    let tail = engine.read_events(case_id, 2).await.unwrap();
    assert_eq!(tail.len(), log.len() - 2);

    let bytes = store.load_snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(bytes, engine.snapshot_case(case_id).await.unwrap());
}

#[tokio::test]
async fn snapshots_can_be_switched_off() {
    init_tracing();
    let store: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let config = EngineConfig::from_yaml_str("persist_snapshots: false\n").unwrap();
    let engine = Engine::builder().config(config).store(store.clone()).build();
    engine.register_specification(single()).await;

    let case_id = engine.start_case("single", CaseData::new()).await.unwrap();
    assert!(store.load_snapshot(case_id).await.unwrap().is_none());
    assert!(!engine.read_events(case_id, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn event_stream_follows_a_case() {
    let engine = engine_with(vec![single()]).await;
    let mut rx = engine.subscribe();
    let case_id = engine.start_case("single", CaseData::new()).await.unwrap();
    let a = item(&engine, case_id, "A").await;
    engine.complete_work_item(a, CaseData::new()).await.unwrap();

    let mut events = Vec::new();
    let collect = async {
        loop {
            let event = rx.recv().await.unwrap();
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("case never completed");

    assert!(matches!(events[0], EngineEvent::CaseStarted { .. }));
    assert!(matches!(
        events[1],
        EngineEvent::WorkItemEnabled { ref task_id, .. } if task_id == "A"
    ));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::TaskFired { .. })));
    assert!(matches!(events.last(), Some(EngineEvent::CaseCompleted { .. })));
}

#[tokio::test]
async fn failed_item_deadlocks_the_case_once() {
    let engine = engine_with(vec![single()]).await;
    let mut rx = engine.subscribe();
    let case_id = engine.start_case("single", CaseData::new()).await.unwrap();
    let a = item(&engine, case_id, "A").await;
    engine.start_work_item(a).await.unwrap();
    drain(&mut rx);

    engine.fail_work_item(a, "timeout").await.unwrap();
    let deadlocks: Vec<EngineEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::CaseDeadlocked { .. }))
        .collect();
    assert_eq!(deadlocks.len(), 1);
    match &deadlocks[0] {
        EngineEvent::CaseDeadlocked { marked_places, .. } => {
            assert_eq!(marked_places.iter().collect::<Vec<_>>(), vec!["A"]);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Nothing changed in the marking: no second report.
    engine
        .update_case_data(case_id, data(json!({"retry": true})))
        .await
        .unwrap();
    assert!(drain(&mut rx)
        .iter()
        .all(|e| !matches!(e, EngineEvent::CaseDeadlocked { .. })));

    let snap = engine.get_case_state(case_id).await.unwrap();
    assert_eq!(snap.status, CaseStatus::Running);
    engine.cancel_case(case_id).await.unwrap();
}

struct JsonLoader;

impl SpecificationLoader for JsonLoader {
    fn load(&self, bytes: &[u8]) -> EngineResult<Specification> {
        let dto: SpecificationDto = serde_json::from_slice(bytes)?;
        Specification::from_dto(&dto)
    }
}

#[tokio::test]
async fn specifications_load_through_a_loader() {
    let engine = engine_with(vec![]).await;
    let bytes = serde_json::to_vec(&json!({
        "id": "loaded",
        "elements": [
            {"kind": "InputCondition", "id": "i"},
            {"kind": "OutputCondition", "id": "o"},
            {"kind": "Task", "id": "A", "automatic": true}
        ],
        "flows": [
            {"from": "i", "to": "A"},
            {"from": "A", "to": "o"}
        ]
    }))
    .unwrap();
    let id = engine.load_specification(&JsonLoader, &bytes).await.unwrap();
    assert_eq!(id, "loaded");

    // A net of one automatic task completes on its own.
    let case_id = engine.start_case("loaded", CaseData::new()).await.unwrap();
    let snap = engine.get_case_state(case_id).await.unwrap();
    assert!(matches!(snap.status, CaseStatus::Completed { .. }));

    let broken = br#"{"id": "broken", "elements": [], "flows": []}"#;
    let err = engine.load_specification(&JsonLoader, broken).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpecification { .. }));
}

#[tokio::test]
async fn recovered_engine_continues_stored_cases() {
    init_tracing();
    let store: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let first = Engine::builder().store(store.clone()).build();
    first.register_specification(s1()).await;
    let mut ids: Vec<CaseId> = Vec::new();
    for _ in 0..3 {
        ids.push(first.start_case("s1", CaseData::new()).await.unwrap());
    }
    ids.sort();

    let second = Engine::builder().store(store).build();
    second.register_specification(s1()).await;
    let mut recovered = second.recover_cases().await.unwrap();
    recovered.sort();
    assert_eq!(recovered, ids);
    assert_eq!(second.case_ids().await, ids);

    let a = item(&second, ids[0], "A").await;
    second.complete_work_item(a, CaseData::new()).await.unwrap();
}

/// Memory store whose commits can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryCaseStore,
    failing: AtomicBool,
}

#[async_trait]
impl CaseStore for FlakyStore {
    async fn save_snapshot(&self, case_id: CaseId, bytes: &[u8]) -> anyhow::Result<()> {
        self.inner.save_snapshot(case_id, bytes).await
    }

    async fn load_snapshot(&self, case_id: CaseId) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.load_snapshot(case_id).await
    }

    async fn delete_snapshot(&self, case_id: CaseId) -> anyhow::Result<()> {
        self.inner.delete_snapshot(case_id).await
    }

    async fn list_cases(&self) -> anyhow::Result<Vec<CaseId>> {
        self.inner.list_cases().await
    }

    async fn commit(
        &self,
        case_id: CaseId,
        events: &[EngineEvent],
        snapshot: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.commit(case_id, events, snapshot).await
    }

    async fn read_events(
        &self,
        case_id: CaseId,
        from_seq: u64,
    ) -> anyhow::Result<Vec<(u64, EngineEvent)>> {
        self.inner.read_events(case_id, from_seq).await
    }
}

#[tokio::test]
async fn failed_store_commit_leaves_log_and_case_untouched() {
    init_tracing();
    let store = Arc::new(FlakyStore::default());
    let engine = Engine::builder().store(store.clone()).build();
    engine.register_specification(single()).await;
    let case_id = engine.start_case("single", CaseData::new()).await.unwrap();
    let a = item(&engine, case_id, "A").await;
    let logged = engine.read_events(case_id, 0).await.unwrap().len();
    let before = engine.get_case_state(case_id).await.unwrap();

    store.failing.store(true, Ordering::SeqCst);
    let err = engine.complete_work_item(a, CaseData::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(engine.read_events(case_id, 0).await.unwrap().len(), logged);
    assert_eq!(engine.get_case_state(case_id).await.unwrap(), before);
    let bytes = store.load_snapshot(case_id).await.unwrap().unwrap();
    assert_eq!(CaseState::from_bytes(&bytes).unwrap().status, CaseStatus::Running);

    // The same request goes through once the store recovers, logged once.
    store.failing.store(false, Ordering::SeqCst);
    engine.complete_work_item(a, CaseData::new()).await.unwrap();
    let log = engine.read_events(case_id, 0).await.unwrap();
    let completions = log
        .iter()
        .filter(|(_, e)| matches!(e, EngineEvent::CaseCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
    assert!(matches!(log.last(), Some((_, EngineEvent::CaseCompleted { .. }))));
}
