//! Multi-instance bookkeeping per case: how many instances of a task were
//! created, which of them are still running and when the task may exit.

use crate::error::{EngineError, EngineResult};
use crate::specification::MultiInstanceParams;
use crate::types::{CreationMode, ElementId, InstanceId, RemainingInstancePolicy, WorkItemId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Pending { completed: u32, threshold: u32 },
    /// The task may exit. `remaining` are the instances still running.
    ThresholdReached { remaining: Vec<InstanceId> },
}

/// One live activation of a multi-instance task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activation {
    pub task: ElementId,
    pub parent: WorkItemId,
    pub params: MultiInstanceParams,
    pub policy: RemainingInstancePolicy,
    pub instances: BTreeMap<InstanceId, InstanceStatus>,
}

impl Activation {
    pub fn completed(&self) -> u32 {
        self.count(InstanceStatus::Completed)
    }

    pub fn running(&self) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|(_, s)| **s == InstanceStatus::Running)
            .map(|(id, _)| *id)
            .collect()
    }

    fn count(&self, status: InstanceStatus) -> u32 {
        self.instances.values().filter(|s| **s == status).count() as u32
    }

    fn completion(&self) -> Completion {
        let completed = self.completed();
        let running = self.running();
        let all_finished =
            self.params.creation_mode == CreationMode::Static && running.is_empty();
        if completed >= self.params.threshold || all_finished {
            Completion::ThresholdReached { remaining: running }
        } else {
            Completion::Pending {
                completed,
                threshold: self.params.threshold,
            }
        }
    }
}

/// Activations keyed by task. A task is busy while active, so there is at
/// most one activation per task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MultiInstanceManager {
    activations: BTreeMap<ElementId, Activation>,
}

impl MultiInstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances to create for an input of `input_count` items.
    pub fn instance_count(
        task: &str,
        params: &MultiInstanceParams,
        input_count: usize,
    ) -> EngineResult<usize> {
        if input_count > params.max as usize {
            return Err(EngineError::InstanceLimitExceeded {
                task: task.to_string(),
                requested: input_count,
                max: params.max,
            });
        }
        Ok(input_count.max(params.min as usize))
    }

    /// Register a new activation and return its instance ids.
    pub fn instantiate(
        &mut self,
        task: &str,
        parent: WorkItemId,
        params: &MultiInstanceParams,
        policy: RemainingInstancePolicy,
        input_count: usize,
    ) -> EngineResult<Vec<InstanceId>> {
        let count = Self::instance_count(task, params, input_count)?;
        let ids: Vec<InstanceId> = (0..count).map(|_| InstanceId::new()).collect();
        self.activations.insert(
            task.to_string(),
            Activation {
                task: task.to_string(),
                parent,
                params: params.clone(),
                policy,
                instances: ids.iter().map(|id| (*id, InstanceStatus::Running)).collect(),
            },
        );
        tracing::debug!(task, count, "Instantiated multi-instance task");
        Ok(ids)
    }

    pub fn add_instance(&mut self, task: &str) -> EngineResult<InstanceId> {
        let activation = self
            .activations
            .get_mut(task)
            .ok_or_else(|| EngineError::NotMultiInstance {
                task: task.to_string(),
            })?;
        if activation.params.creation_mode != CreationMode::Dynamic {
            return Err(EngineError::DynamicCreationDisabled {
                task: task.to_string(),
            });
        }
        let created = activation.instances.len();
        if created >= activation.params.max as usize {
            return Err(EngineError::InstanceLimitExceeded {
                task: task.to_string(),
                requested: created + 1,
                max: activation.params.max,
            });
        }
        let id = InstanceId::new();
        activation.instances.insert(id, InstanceStatus::Running);
        Ok(id)
    }

    /// Record the outcome of one instance and report whether the task may
    /// exit now.
    pub fn record_outcome(
        &mut self,
        task: &str,
        instance: InstanceId,
        outcome: InstanceStatus,
    ) -> EngineResult<Completion> {
        let activation = self
            .activations
            .get_mut(task)
            .ok_or_else(|| EngineError::NotMultiInstance {
                task: task.to_string(),
            })?;
        match activation.instances.get_mut(&instance) {
            Some(status) => *status = outcome,
            None => {
                return Err(EngineError::UnknownElement {
                    id: format!("{task}#{instance}"),
                })
            }
        }
        Ok(activation.completion())
    }

    pub fn record_completion(
        &mut self,
        task: &str,
        instance: InstanceId,
    ) -> EngineResult<Completion> {
        self.record_outcome(task, instance, InstanceStatus::Completed)
    }

    /// Remove the activation once the task exits or is cancelled.
    pub fn contract(&mut self, task: &str) -> Option<Activation> {
        self.activations.remove(task)
    }

    /// Activations whose exit condition holds but that have not exited yet,
    /// with their still-running instances.
    pub fn ready_to_exit(&self) -> Vec<(ElementId, Vec<InstanceId>)> {
        self.activations
            .values()
            .filter_map(|a| match a.completion() {
                Completion::ThresholdReached { remaining } => Some((a.task.clone(), remaining)),
                Completion::Pending { .. } => None,
            })
            .collect()
    }

    pub fn is_active(&self, task: &str) -> bool {
        self.activations.contains_key(task)
    }

    pub fn clear(&mut self) {
        self.activations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CaseId;

    fn parent() -> WorkItemId {
        WorkItemId::new(CaseId::new())
    }

    #[test]
    fn creates_max_of_min_and_input() {
        let params = MultiInstanceParams::new(2, 5, 3);
        let mut mi = MultiInstanceManager::new();
        let ids = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 0)
            .unwrap();
        assert_eq!(ids.len(), 2);

        let mut mi = MultiInstanceManager::new();
        let ids = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 4)
            .unwrap();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn input_above_max_is_refused() {
        let params = MultiInstanceParams::new(2, 5, 3);
        let mut mi = MultiInstanceManager::new();
        let err = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 6)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InstanceLimitExceeded { requested: 6, max: 5, .. }
        ));
        assert!(!mi.is_active("T"));
    }

    #[test]
    fn threshold_reached_on_third_completion() {
        let params = MultiInstanceParams::new(2, 5, 3);
        let mut mi = MultiInstanceManager::new();
        let ids = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 5)
            .unwrap();

        assert_eq!(
            mi.record_completion("T", ids[0]).unwrap(),
            Completion::Pending {
                completed: 1,
                threshold: 3
            }
        );
        assert!(matches!(
            mi.record_completion("T", ids[1]).unwrap(),
            Completion::Pending { completed: 2, .. }
        ));
        match mi.record_completion("T", ids[2]).unwrap() {
            Completion::ThresholdReached { mut remaining } => {
                let mut expected = vec![ids[3], ids[4]];
                remaining.sort();
                expected.sort();
                assert_eq!(remaining, expected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn static_task_exits_when_all_instances_finished() {
        let params = MultiInstanceParams::new(2, 5, 2);
        let mut mi = MultiInstanceManager::new();
        let ids = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 0)
            .unwrap();
        mi.record_outcome("T", ids[0], InstanceStatus::Failed).unwrap();
        assert!(matches!(
            mi.record_completion("T", ids[1]).unwrap(),
            Completion::ThresholdReached { ref remaining } if remaining.is_empty()
        ));
    }

    #[test]
    fn ready_to_exit_lists_only_finished_activations() {
        let params = MultiInstanceParams::new(2, 5, 2);
        let mut mi = MultiInstanceManager::new();
        let ids = mi
            .instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 0)
            .unwrap();
        mi.instantiate("U", parent(), &params, RemainingInstancePolicy::ForceComplete, 0)
            .unwrap();
        assert!(mi.ready_to_exit().is_empty());

        mi.record_outcome("T", ids[0], InstanceStatus::Cancelled).unwrap();
        mi.record_outcome("T", ids[1], InstanceStatus::Cancelled).unwrap();
        assert_eq!(mi.ready_to_exit(), vec![("T".to_string(), Vec::new())]);

        mi.contract("T");
        assert!(mi.ready_to_exit().is_empty());
    }

    #[test]
    fn dynamic_instances_up_to_max() {
        let params = MultiInstanceParams::new(1, 2, 1).dynamic();
        let mut mi = MultiInstanceManager::new();
        mi.instantiate("T", parent(), &params, RemainingInstancePolicy::Abandon, 0)
            .unwrap();
        mi.add_instance("T").unwrap();
        assert!(matches!(
            mi.add_instance("T"),
            Err(EngineError::InstanceLimitExceeded { .. })
        ));
    }

    #[test]
    fn static_tasks_refuse_new_instances() {
        let params = MultiInstanceParams::new(1, 3, 1);
        let mut mi = MultiInstanceManager::new();
        mi.instantiate("T", parent(), &params, RemainingInstancePolicy::ForceComplete, 0)
            .unwrap();
        assert!(matches!(
            mi.add_instance("T"),
            Err(EngineError::DynamicCreationDisabled { .. })
        ));
        assert!(matches!(
            mi.add_instance("U"),
            Err(EngineError::NotMultiInstance { .. })
        ));
    }
}
