//! Shared fixtures for the integration scenarios.

#![allow(dead_code)]

use serde_json::Value;
use tokio::sync::broadcast;
use yawl_lite_core::{
    CaseData, CaseId, Engine, EngineConfig, EngineEvent, Flow, JoinType, Specification,
    SpecificationBuilder, SplitType, Task, WorkItem, WorkItemId,
};

/// Install a fmt subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn data(value: Value) -> CaseData {
    match value {
        Value::Object(map) => map,
        other => panic!("case data must be an object, got {other}"),
    }
}

pub async fn engine_with(specs: Vec<Specification>) -> Engine {
    init_tracing();
    let engine = Engine::new(EngineConfig::default());
    for spec in specs {
        engine.register_specification(spec).await;
    }
    engine
}

/// The single live item of `task`.
pub async fn item(engine: &Engine, case_id: CaseId, task: &str) -> WorkItemId {
    let snap = engine.get_case_state(case_id).await.unwrap();
    let items = snap.items_for(task);
    assert_eq!(items.len(), 1, "expected one live item for {task}, got {items:?}");
    items[0].id
}

pub fn task_ids(items: &[WorkItem]) -> Vec<String> {
    let mut ids: Vec<String> = items.iter().map(|w| w.task_id.clone()).collect();
    ids.sort();
    ids
}

/// Everything broadcast so far. Events of a command are sent before its
/// reply, so after awaiting the command this sees all of them.
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// i -> A (AND-split) -> [B, C] -> D (AND-join) -> o
pub fn s1() -> Specification {
    SpecificationBuilder::new("s1")
        .input_condition("i")
        .output_condition("o")
        .task(Task::new("A").split(SplitType::And))
        .task(Task::new("B"))
        .task(Task::new("C"))
        .task(Task::new("D").join(JoinType::And))
        .flow(Flow::new("i", "A"))
        .flow(Flow::new("A", "B"))
        .flow(Flow::new("A", "C"))
        .flow(Flow::new("B", "D"))
        .flow(Flow::new("C", "D"))
        .flow(Flow::new("D", "o"))
        .build()
        .unwrap()
}

/// i -> A (XOR: `left` to B, otherwise C) -> [B | C] -> D (OR-join) -> o
pub fn xor_then_or() -> Specification {
    SpecificationBuilder::new("xor-or")
        .input_condition("i")
        .output_condition("o")
        .task(Task::new("A").split(SplitType::Xor))
        .task(Task::new("B"))
        .task(Task::new("C"))
        .task(Task::new("D").join(JoinType::Or))
        .flow(Flow::new("i", "A"))
        .flow(Flow::new("A", "B").when("left"))
        .flow(Flow::new("A", "C").default_flow())
        .flow(Flow::new("B", "D"))
        .flow(Flow::new("C", "D"))
        .flow(Flow::new("D", "o"))
        .build()
        .unwrap()
}

/// i -> A -> o
pub fn single() -> Specification {
    SpecificationBuilder::new("single")
        .input_condition("i")
        .output_condition("o")
        .task(Task::new("A"))
        .flow(Flow::new("i", "A"))
        .flow(Flow::new("A", "o"))
        .build()
        .unwrap()
}
