//! Work item state machine and the per-case set of work items.
//!
//! ```text
//! Enabled ──Fire──▶ Fired ──Start──▶ Executing ──Complete──▶ Completed*
//!    │                │                  │ └──────Fail─────▶ Failed*
//!    └────Cancel──────┴──────Cancel──────┴─────────────────▶ Cancelled*
//! ```
//!
//! Terminal items stay in the live map until `retire_terminal()` moves them
//! to the tombstones, so a late request for them is an `IllegalTransition`
//! rather than an `UnknownWorkItem`.

use crate::error::{EngineError, EngineResult};
use crate::types::{now_ms, CaseData, CaseId, ElementId, InstanceId, Timestamp, WorkItemId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemState {
    Enabled,
    Fired,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemState::Completed | WorkItemState::Failed | WorkItemState::Cancelled
        )
    }

    /// Target state for `event`, or `None` if the transition is illegal.
    pub fn on(self, event: WorkItemEvent) -> Option<WorkItemState> {
        use WorkItemEvent as E;
        use WorkItemState as S;
        match (self, event) {
            (S::Enabled, E::Fire) => Some(S::Fired),
            (S::Fired, E::Start) => Some(S::Executing),
            (S::Executing, E::Complete) => Some(S::Completed),
            (S::Executing, E::Fail) => Some(S::Failed),
            (S::Enabled | S::Fired | S::Executing, E::Cancel) => Some(S::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemEvent {
    Fire,
    Start,
    Complete,
    Fail,
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub case_id: CaseId,
    pub task_id: ElementId,
    pub instance_id: Option<InstanceId>,
    pub state: WorkItemState,
    /// Set on the children of a multi-instance task.
    pub parent: Option<WorkItemId>,
    /// The umbrella item of a multi-instance task. Driven by the engine only.
    pub is_parent: bool,
    /// Abandoned multi-instance child: may still complete, without effect
    /// on the net.
    pub detached: bool,
    pub data: CaseData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub enabled_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkItem {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItemLifecycle {
    case_id: CaseId,
    live: BTreeMap<WorkItemId, WorkItem>,
    tombstones: BTreeMap<WorkItemId, WorkItemState>,
}

impl WorkItemLifecycle {
    pub fn new(case_id: CaseId) -> Self {
        Self {
            case_id,
            live: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Create an `Enabled` item for a task (or a task instance).
    pub fn enable(
        &mut self,
        task: &str,
        instance: Option<InstanceId>,
        is_parent: bool,
    ) -> EngineResult<WorkItem> {
        let duplicate = self.live.values().any(|w| {
            w.is_live() && !w.detached && w.task_id == task && w.instance_id == instance
        });
        if duplicate {
            return Err(EngineError::AlreadyEnabled {
                task: task.to_string(),
                instance,
            });
        }
        let item = self.new_item(task, instance, WorkItemState::Enabled, None, is_parent);
        self.live.insert(item.id, item.clone());
        Ok(item)
    }

    /// Create a child of a multi-instance parent. Children start `Fired`.
    pub fn create_child(&mut self, parent: WorkItemId, instance: InstanceId) -> EngineResult<WorkItem> {
        let task = self.require(parent)?.task_id.clone();
        let item = self.new_item(&task, Some(instance), WorkItemState::Fired, Some(parent), false);
        self.live.insert(item.id, item.clone());
        Ok(item)
    }

    /// Validate `event` against the current state without applying it.
    pub fn check(&self, id: WorkItemId, event: WorkItemEvent) -> EngineResult<WorkItemState> {
        let from = self.state_of(id)?;
        from.on(event)
            .ok_or(EngineError::IllegalTransition { id, from, event })
    }

    pub fn transition(&mut self, id: WorkItemId, event: WorkItemEvent) -> EngineResult<WorkItem> {
        let to = self.check(id, event)?;
        let item = self
            .live
            .get_mut(&id)
            .ok_or(EngineError::UnknownWorkItem { id })?;
        item.state = to;
        item.updated_at = now_ms();
        Ok(item.clone())
    }

    pub fn assign_instance(&mut self, id: WorkItemId, instance: InstanceId) -> EngineResult<()> {
        let item = self
            .live
            .get_mut(&id)
            .ok_or(EngineError::UnknownWorkItem { id })?;
        item.instance_id = Some(instance);
        Ok(())
    }

    pub fn get(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.live.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkItemId) -> Option<&mut WorkItem> {
        self.live.get_mut(&id)
    }

    pub fn state_of(&self, id: WorkItemId) -> EngineResult<WorkItemState> {
        if let Some(item) = self.live.get(&id) {
            return Ok(item.state);
        }
        self.tombstones
            .get(&id)
            .copied()
            .ok_or(EngineError::UnknownWorkItem { id })
    }

    /// Non-terminal items.
    pub fn live(&self) -> impl Iterator<Item = &WorkItem> + '_ {
        self.live.values().filter(|w| w.is_live())
    }

    pub fn has_live(&self) -> bool {
        self.live().next().is_some()
    }

    /// The `Enabled` item of a task, if any.
    pub fn enabled_for(&self, task: &str) -> Option<&WorkItem> {
        self.live
            .values()
            .find(|w| w.state == WorkItemState::Enabled && w.task_id == task)
    }

    pub fn for_instance(&self, task: &str, instance: InstanceId) -> Option<&WorkItem> {
        self.live
            .values()
            .find(|w| w.is_live() && w.task_id == task && w.instance_id == Some(instance))
    }

    pub fn children(&self, parent: WorkItemId) -> Vec<&WorkItem> {
        self.live
            .values()
            .filter(|w| w.parent == Some(parent))
            .collect()
    }

    /// Move terminal items to the tombstones. Returns the retired ids.
    pub fn retire_terminal(&mut self) -> Vec<WorkItemId> {
        let retired: Vec<WorkItemId> = self
            .live
            .values()
            .filter(|w| w.state.is_terminal())
            .map(|w| w.id)
            .collect();
        for id in &retired {
            if let Some(item) = self.live.remove(id) {
                self.tombstones.insert(*id, item.state);
            }
        }
        retired
    }

    fn require(&self, id: WorkItemId) -> EngineResult<&WorkItem> {
        self.live.get(&id).ok_or(EngineError::UnknownWorkItem { id })
    }

    fn new_item(
        &self,
        task: &str,
        instance: Option<InstanceId>,
        state: WorkItemState,
        parent: Option<WorkItemId>,
        is_parent: bool,
    ) -> WorkItem {
        let now = now_ms();
        WorkItem {
            id: WorkItemId::new(self.case_id),
            case_id: self.case_id,
            task_id: task.to_string(),
            instance_id: instance,
            state,
            parent,
            is_parent,
            detached: false,
            data: CaseData::new(),
            failure: None,
            enabled_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_path_to_completion() {
        let mut wl = WorkItemLifecycle::new(CaseId::new());
        let item = wl.enable("A", None, false).unwrap();
        assert_eq!(item.state, WorkItemState::Enabled);
        assert_eq!(wl.transition(item.id, WorkItemEvent::Fire).unwrap().state, WorkItemState::Fired);
        assert_eq!(
            wl.transition(item.id, WorkItemEvent::Start).unwrap().state,
            WorkItemState::Executing
        );
        assert_eq!(
            wl.transition(item.id, WorkItemEvent::Complete).unwrap().state,
            WorkItemState::Completed
        );
        assert!(!wl.has_live());
    }

    #[test]
    fn illegal_transitions_are_reported() {
        let mut wl = WorkItemLifecycle::new(CaseId::new());
        let item = wl.enable("A", None, false).unwrap();
        let err = wl.transition(item.id, WorkItemEvent::Complete).unwrap_err();
        assert!(matches!(
            err,
            EngineError::IllegalTransition {
                from: WorkItemState::Enabled,
                event: WorkItemEvent::Complete,
                ..
            }
        ));
        assert!(matches!(
            wl.transition(item.id, WorkItemEvent::Fail),
            Err(EngineError::IllegalTransition { .. })
        ));
        assert_eq!(wl.get(item.id).unwrap().state, WorkItemState::Enabled);
    }

    #[test]
    fn every_live_state_can_be_cancelled() {
        for steps in [
            &[][..],
            &[WorkItemEvent::Fire][..],
            &[WorkItemEvent::Fire, WorkItemEvent::Start][..],
        ] {
            let mut wl = WorkItemLifecycle::new(CaseId::new());
            let item = wl.enable("A", None, false).unwrap();
            for step in steps {
                wl.transition(item.id, *step).unwrap();
            }
            assert_eq!(
                wl.transition(item.id, WorkItemEvent::Cancel).unwrap().state,
                WorkItemState::Cancelled
            );
        }
    }

    #[test]
    fn duplicate_enable_is_refused() {
        let mut wl = WorkItemLifecycle::new(CaseId::new());
        wl.enable("A", None, false).unwrap();
        assert!(matches!(
            wl.enable("A", None, false),
            Err(EngineError::AlreadyEnabled { .. })
        ));
        let inst = InstanceId::new();
        wl.enable("A", Some(inst), false).unwrap();
    }

    #[test]
    fn retired_items_answer_with_illegal_transition() {
        let mut wl = WorkItemLifecycle::new(CaseId::new());
        let item = wl.enable("A", None, false).unwrap();
        wl.transition(item.id, WorkItemEvent::Cancel).unwrap();
        assert_eq!(wl.retire_terminal(), vec![item.id]);
        assert!(wl.get(item.id).is_none());
        assert!(matches!(
            wl.transition(item.id, WorkItemEvent::Fire),
            Err(EngineError::IllegalTransition {
                from: WorkItemState::Cancelled,
                ..
            })
        ));
        let stranger = WorkItemId::new(CaseId::new());
        assert!(matches!(
            wl.transition(stranger, WorkItemEvent::Fire),
            Err(EngineError::UnknownWorkItem { .. })
        ));
    }

    #[test]
    fn children_inherit_task_and_start_fired() {
        let mut wl = WorkItemLifecycle::new(CaseId::new());
        let parent = wl.enable("MI", None, true).unwrap();
        let child = wl.create_child(parent.id, InstanceId::new()).unwrap();
        assert_eq!(child.task_id, "MI");
        assert_eq!(child.state, WorkItemState::Fired);
        assert_eq!(wl.children(parent.id).len(), 1);
    }
}
