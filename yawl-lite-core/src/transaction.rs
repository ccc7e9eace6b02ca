//! Firing transactions.
//!
//! A transaction works on a private copy of the case state. Every command
//! (complete, cancel, add instance, ...) runs against the copy, then
//! `settle()` re-evaluates the net until it is quiescent. The controller
//! commits the copy only if everything succeeded, so a failing command
//! never leaves a half-applied marking behind.

use crate::case::CaseState;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{ChangeReason, EngineEvent};
use crate::firing::{ExitPlan, FiringEngine};
use crate::guard::GuardEvaluator;
use crate::marking::MarkingDelta;
use crate::multi_instance::{Completion, InstanceStatus};
use crate::specification::{MultiInstanceParams, Specification};
use crate::types::{
    now_ms, CaseData, CaseStatus, ElementId, InstanceId, RemainingInstancePolicy, Token,
    WorkItemId,
};
use crate::work_item::{WorkItem, WorkItemEvent, WorkItemState};
use serde_json::Value;

/// Result of a successful transaction, ready to be committed.
pub(crate) struct Committed<T> {
    pub state: CaseState,
    pub events: Vec<EngineEvent>,
    pub enabled: Vec<WorkItem>,
    pub value: T,
}

pub(crate) struct Transaction<'a> {
    spec: &'a Specification,
    firing: FiringEngine<'a>,
    config: &'a EngineConfig,
    state: CaseState,
    events: Vec<EngineEvent>,
    enabled: Vec<WorkItemId>,
}

impl<'a> Transaction<'a> {
    pub fn begin(
        spec: &'a Specification,
        guards: &'a dyn GuardEvaluator,
        config: &'a EngineConfig,
        state: CaseState,
    ) -> Self {
        Self {
            spec,
            firing: FiringEngine::new(spec, guards),
            config,
            state,
            events: Vec::new(),
            enabled: Vec::new(),
        }
    }

    pub fn finish<T>(self, value: T) -> Committed<T> {
        let enabled = self
            .enabled
            .iter()
            .filter_map(|id| self.state.work_items.get(*id))
            .filter(|w| w.state == WorkItemState::Enabled)
            .cloned()
            .collect();
        Committed {
            state: self.state,
            events: self.events,
            enabled,
            value,
        }
    }

    // ─── Commands ─────────────────────────────────────────────

    /// Put the initial token on the input condition.
    pub fn start_case(&mut self) -> EngineResult<()> {
        let mut delta = MarkingDelta::new();
        delta.add(Token::condition(self.spec.input_condition()), 1);
        self.state.marking.apply_delta(&delta)?;
        self.events.push(EngineEvent::CaseStarted {
            case_id: self.state.id,
            specification_id: self.state.specification_id.clone(),
        });
        tracing::info!(
            case_id = %self.state.id,
            specification = %self.state.specification_id,
            "Case started"
        );
        Ok(())
    }

    /// Fire (if needed) and start a work item. For a multi-instance parent,
    /// returns the started children.
    pub fn start_work_item(&mut self, id: WorkItemId) -> EngineResult<Vec<WorkItem>> {
        let item = self.live_item(id, WorkItemEvent::Start)?;
        self.ensure_accepting()?;
        self.state.stall = None;

        if item.is_parent {
            if item.state != WorkItemState::Enabled {
                return Err(EngineError::IllegalTransition {
                    id,
                    from: item.state,
                    event: WorkItemEvent::Start,
                });
            }
            let children = self.fire(id, ChangeReason::Requested)?;
            return children
                .into_iter()
                .map(|child| self.transition(child, WorkItemEvent::Start, ChangeReason::Requested))
                .collect();
        }

        if item.state == WorkItemState::Enabled {
            self.fire(id, ChangeReason::Requested)?;
        }
        Ok(vec![self.transition(
            id,
            WorkItemEvent::Start,
            ChangeReason::Requested,
        )?])
    }

    /// Complete a work item and route the net onwards.
    pub fn complete_work_item(&mut self, id: WorkItemId, output: CaseData) -> EngineResult<()> {
        let item = self.live_item(id, WorkItemEvent::Complete)?;
        self.ensure_accepting()?;
        if item.is_parent {
            return Err(EngineError::IllegalTransition {
                id,
                from: item.state,
                event: WorkItemEvent::Complete,
            });
        }
        self.state.stall = None;

        if item.state == WorkItemState::Enabled {
            self.fire(id, ChangeReason::FastForward)?;
        }
        if self.state.work_items.state_of(id)? == WorkItemState::Fired {
            self.transition(id, WorkItemEvent::Start, ChangeReason::FastForward)?;
        }

        for (key, value) in &output {
            self.state.data.insert(key.clone(), value.clone());
        }
        if let Some(w) = self.state.work_items.get_mut(id) {
            w.data = output;
        }
        let item = self.transition(id, WorkItemEvent::Complete, ChangeReason::Requested)?;
        let instance = self.instance_of(&item)?;

        if item.detached {
            tracing::debug!(case_id = %self.state.id, task = %item.task_id, "Abandoned instance completed");
            return Ok(());
        }
        if item.parent.is_some() {
            let completion = self
                .state
                .multi_instance
                .record_completion(&item.task_id, instance)?;
            return self.after_instance_outcome(&item.task_id, completion);
        }
        self.exit_task(&item.task_id, &[instance])
    }

    /// Executing → Failed. The instance token stays on the task place.
    pub fn fail_work_item(&mut self, id: WorkItemId, reason: String) -> EngineResult<WorkItem> {
        let item = self.live_item(id, WorkItemEvent::Fail)?;
        self.ensure_accepting()?;
        if item.is_parent {
            return Err(EngineError::IllegalTransition {
                id,
                from: item.state,
                event: WorkItemEvent::Fail,
            });
        }
        let mut failed = self.transition(id, WorkItemEvent::Fail, ChangeReason::Requested)?;
        if let Some(w) = self.state.work_items.get_mut(id) {
            w.failure = Some(reason.clone());
            failed = w.clone();
        }
        tracing::warn!(
            case_id = %self.state.id,
            task = %item.task_id,
            reason = %reason,
            "Work item failed"
        );

        if item.parent.is_some() && !item.detached {
            let instance = self.instance_of(&item)?;
            let completion = self.state.multi_instance.record_outcome(
                &item.task_id,
                instance,
                InstanceStatus::Failed,
            )?;
            self.after_instance_outcome(&item.task_id, completion)?;
        }
        Ok(failed)
    }

    /// Cancel one live work item, removing its tokens. Accepted while the
    /// case is suspended.
    pub fn cancel_work_item(&mut self, id: WorkItemId) -> EngineResult<()> {
        let item = self.live_item(id, WorkItemEvent::Cancel)?;
        self.ensure_running()?;
        let task = item.task_id.clone();

        if item.state == WorkItemState::Enabled {
            // Not fired yet: the join's inputs are consumed without producing
            // an instance, so the task is not immediately re-enabled.
            let delta =
                self.firing
                    .plan_fire(&task, &self.state.marking, &self.state.data, &[])?;
            self.state.marking.apply_delta(&delta)?;
            self.transition(id, WorkItemEvent::Cancel, ChangeReason::Requested)?;
            return Ok(());
        }

        if item.is_parent {
            self.cancel_activation(&task, ChangeReason::ParentCancelled)?;
            if self.state.work_items.get(id).is_some_and(WorkItem::is_live) {
                self.transition(id, WorkItemEvent::Cancel, ChangeReason::Requested)?;
            }
            return Ok(());
        }

        let instance = self.instance_of(&item)?;
        if !item.detached {
            let mut delta = MarkingDelta::new();
            let token = Token::instance(task.clone(), instance);
            let n = self.state.marking.count(&token);
            delta.remove(token, n);
            self.state.marking.apply_delta(&delta)?;
        }
        self.transition(id, WorkItemEvent::Cancel, ChangeReason::Requested)?;

        if item.parent.is_some() && !item.detached {
            let completion = self.state.multi_instance.record_outcome(
                &task,
                instance,
                InstanceStatus::Cancelled,
            )?;
            self.after_instance_outcome(&task, completion)?;
        }
        Ok(())
    }

    /// Create one more instance of a running dynamic multi-instance task.
    pub fn add_instance(&mut self, parent: WorkItemId) -> EngineResult<WorkItem> {
        let item = self.live_item(parent, WorkItemEvent::Start)?;
        self.ensure_accepting()?;
        if !item.is_parent {
            return Err(EngineError::NotMultiInstance {
                task: item.task_id,
            });
        }
        if !self.state.multi_instance.is_active(&item.task_id) {
            return Err(EngineError::IllegalTransition {
                id: parent,
                from: item.state,
                event: WorkItemEvent::Start,
            });
        }
        let instance = self.state.multi_instance.add_instance(&item.task_id)?;
        let mut delta = MarkingDelta::new();
        delta.add(Token::instance(item.task_id.clone(), instance), 1);
        self.state.marking.apply_delta(&delta)?;

        let child = self.state.work_items.create_child(parent, instance)?;
        self.events.push(EngineEvent::WorkItemEnabled {
            case_id: self.state.id,
            work_item_id: child.id,
            task_id: child.task_id.clone(),
        });
        tracing::debug!(case_id = %self.state.id, task = %item.task_id, "Added instance");
        Ok(child)
    }

    pub fn update_case_data(&mut self, patch: CaseData) -> EngineResult<()> {
        self.ensure_accepting()?;
        for (key, value) in patch {
            self.state.data.insert(key, value);
        }
        self.state.stall = None;
        Ok(())
    }

    pub fn suspend(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        if !self.state.suspended {
            self.state.suspended = true;
            self.events.push(EngineEvent::CaseSuspended {
                case_id: self.state.id,
            });
            tracing::info!(case_id = %self.state.id, "Case suspended");
        }
        Ok(())
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        if self.state.suspended {
            self.state.suspended = false;
            self.events.push(EngineEvent::CaseResumed {
                case_id: self.state.id,
            });
            tracing::info!(case_id = %self.state.id, "Case resumed");
        }
        Ok(())
    }

    /// Cancel every live work item and clear the marking. A case that is
    /// already finished is left alone.
    pub fn cancel_case(&mut self) -> EngineResult<()> {
        if self.state.status.is_terminal() {
            return Ok(());
        }
        let live: Vec<WorkItemId> = self.state.work_items.live().map(|w| w.id).collect();
        for id in live {
            self.transition(id, WorkItemEvent::Cancel, ChangeReason::CaseCancelled)?;
        }
        let mut delta = MarkingDelta::new();
        for entry in self.state.marking.export_tokens() {
            delta.remove(entry.token, entry.count);
        }
        self.state.marking.apply_delta(&delta)?;
        self.state.multi_instance.clear();
        self.state.status = CaseStatus::Cancelled { at: now_ms() };
        self.events.push(EngineEvent::CaseCancelled {
            case_id: self.state.id,
        });
        tracing::info!(case_id = %self.state.id, "Case cancelled");
        Ok(())
    }

    // ─── Settling ─────────────────────────────────────────────

    /// Re-evaluate the net after a change: exit multi-instance tasks that
    /// became ready, withdraw, run automatic tasks, enable, then detect
    /// completion or deadlock. A suspended case does not route; the work is
    /// picked up by the settle that follows `resume()`.
    pub fn settle(&mut self) -> EngineResult<()> {
        if !self.state.is_running() || self.state.suspended {
            return Ok(());
        }
        for (task, remaining) in self.state.multi_instance.ready_to_exit() {
            self.exit_multi_instance(&task, remaining)?;
        }
        self.advance()?;
        self.check_completion();
        if self.state.is_running() {
            self.check_deadlock();
        }
        Ok(())
    }

    fn advance(&mut self) -> EngineResult<()> {
        let mut auto_steps = 0u32;
        loop {
            self.withdraw_disabled()?;

            let automatic = self
                .spec
                .tasks()
                .filter(|t| t.automatic)
                .find(|t| {
                    self.firing
                        .is_enabled(&t.id, &self.state.marking, &self.state.data)
                })
                .map(|t| t.id.clone());
            if let Some(task) = automatic {
                auto_steps += 1;
                if auto_steps > self.config.max_auto_steps {
                    return Err(EngineError::AutoStepLimitExceeded {
                        limit: self.config.max_auto_steps,
                    });
                }
                self.run_automatic(&task)?;
                continue;
            }

            let candidates: Vec<(ElementId, bool)> = self
                .spec
                .tasks()
                .filter(|t| !t.automatic)
                .filter(|t| self.state.work_items.enabled_for(&t.id).is_none())
                .filter(|t| {
                    self.firing
                        .is_enabled(&t.id, &self.state.marking, &self.state.data)
                })
                .map(|t| (t.id.clone(), t.multi_instance.is_some()))
                .collect();
            for (task, is_parent) in candidates {
                let item = self.state.work_items.enable(&task, None, is_parent)?;
                self.events.push(EngineEvent::WorkItemEnabled {
                    case_id: self.state.id,
                    work_item_id: item.id,
                    task_id: task.clone(),
                });
                tracing::debug!(case_id = %self.state.id, task = %task, "Work item enabled");
                self.enabled.push(item.id);
            }
            return Ok(());
        }
    }

    /// Enabled items whose task lost its enablement go to Cancelled.
    fn withdraw_disabled(&mut self) -> EngineResult<()> {
        let stale: Vec<(WorkItemId, ElementId)> = self
            .state
            .work_items
            .live()
            .filter(|w| w.state == WorkItemState::Enabled)
            .filter(|w| {
                !self
                    .firing
                    .is_enabled(&w.task_id, &self.state.marking, &self.state.data)
            })
            .map(|w| (w.id, w.task_id.clone()))
            .collect();
        for (id, task) in stale {
            self.transition(id, WorkItemEvent::Cancel, ChangeReason::Withdrawn)?;
            tracing::info!(case_id = %self.state.id, task = %task, "Work item withdrawn");
        }
        Ok(())
    }

    fn run_automatic(&mut self, task: &str) -> EngineResult<()> {
        let instance = InstanceId::new();
        let delta =
            self.firing
                .plan_fire(task, &self.state.marking, &self.state.data, &[instance])?;
        self.state.marking.apply_delta(&delta)?;
        self.events.push(EngineEvent::TaskFired {
            case_id: self.state.id,
            task_id: task.to_string(),
            instances: vec![instance],
        });
        tracing::debug!(case_id = %self.state.id, task, "Automatic task fired");
        self.exit_task(task, &[instance])
    }

    fn check_completion(&mut self) {
        let output = self.spec.output_condition();
        if self.state.marking.is_marked(output) && !self.state.work_items.has_live() {
            self.state.status = CaseStatus::Completed { at: now_ms() };
            self.state.deadlock_digest = None;
            self.events.push(EngineEvent::CaseCompleted {
                case_id: self.state.id,
            });
            tracing::info!(case_id = %self.state.id, "Case completed");
        }
    }

    fn check_deadlock(&mut self) {
        let marking = &self.state.marking;
        let stuck = !self.state.work_items.has_live()
            && !marking.is_marked(self.spec.output_condition())
            && !marking.is_empty();
        if !stuck {
            self.state.deadlock_digest = None;
            return;
        }
        let digest = hex::encode(marking.digest());
        if self.state.deadlock_digest.as_deref() == Some(digest.as_str()) {
            return;
        }
        let marked_places = marking.marked_places();
        tracing::warn!(
            case_id = %self.state.id,
            places = ?marked_places,
            "Case deadlocked"
        );
        self.events.push(EngineEvent::CaseDeadlocked {
            case_id: self.state.id,
            marked_places,
        });
        self.state.deadlock_digest = Some(digest);
    }

    // ─── Firing ───────────────────────────────────────────────

    /// Enabled → Fired. Returns the items that now hold instances: the item
    /// itself, or the children of a multi-instance parent (which itself moves
    /// on to Executing).
    fn fire(&mut self, id: WorkItemId, reason: ChangeReason) -> EngineResult<Vec<WorkItemId>> {
        self.state.work_items.check(id, WorkItemEvent::Fire)?;
        let task = self.live_item(id, WorkItemEvent::Fire)?.task_id;

        let Some(params) = self.spec.multi_instance_params(&task)?.cloned() else {
            let instance = InstanceId::new();
            let delta = self.firing.plan_fire(
                &task,
                &self.state.marking,
                &self.state.data,
                &[instance],
            )?;
            self.state.marking.apply_delta(&delta)?;
            self.state.work_items.assign_instance(id, instance)?;
            self.transition(id, WorkItemEvent::Fire, reason)?;
            self.events.push(EngineEvent::TaskFired {
                case_id: self.state.id,
                task_id: task.clone(),
                instances: vec![instance],
            });
            tracing::debug!(case_id = %self.state.id, task = %task, "Task fired");
            return Ok(vec![id]);
        };

        let input_count = self.input_count(&task, &params);
        let policy = params
            .remaining
            .unwrap_or(self.config.default_remaining_policy);
        let instances =
            self.state
                .multi_instance
                .instantiate(&task, id, &params, policy, input_count)?;
        let delta =
            self.firing
                .plan_fire(&task, &self.state.marking, &self.state.data, &instances)?;
        self.state.marking.apply_delta(&delta)?;
        self.transition(id, WorkItemEvent::Fire, reason)?;
        self.transition(id, WorkItemEvent::Start, ChangeReason::Engine)?;

        let mut children = Vec::with_capacity(instances.len());
        for instance in &instances {
            let child = self.state.work_items.create_child(id, *instance)?;
            self.events.push(EngineEvent::WorkItemEnabled {
                case_id: self.state.id,
                work_item_id: child.id,
                task_id: task.clone(),
            });
            children.push(child.id);
        }
        self.events.push(EngineEvent::TaskFired {
            case_id: self.state.id,
            task_id: task.clone(),
            instances: instances.clone(),
        });
        tracing::debug!(
            case_id = %self.state.id,
            task = %task,
            instances = instances.len(),
            "Multi-instance task fired"
        );
        Ok(children)
    }

    fn input_count(&self, task: &str, params: &MultiInstanceParams) -> usize {
        let Some(key) = &params.input_key else {
            return 0;
        };
        match self.state.data.get(key) {
            Some(Value::Array(items)) => items.len(),
            Some(_) => {
                tracing::warn!(task, key = %key, "Multi-instance input is not an array");
                0
            }
            None => 0,
        }
    }

    fn exit_task(&mut self, task: &str, own: &[InstanceId]) -> EngineResult<()> {
        let plan =
            self.firing
                .plan_exit(task, &self.state.marking, &self.state.data, own)?;
        self.state.marking.apply_delta(&plan.delta)?;
        self.apply_cancellation(task, &plan)?;
        self.push_exit(task, &plan);
        Ok(())
    }

    fn after_instance_outcome(&mut self, task: &str, completion: Completion) -> EngineResult<()> {
        match completion {
            Completion::Pending {
                completed,
                threshold,
            } => {
                tracing::debug!(
                    case_id = %self.state.id,
                    task,
                    completed,
                    threshold,
                    "Multi-instance task pending"
                );
                Ok(())
            }
            Completion::ThresholdReached { .. } if self.state.suspended => {
                tracing::debug!(case_id = %self.state.id, task, "Multi-instance exit deferred");
                Ok(())
            }
            Completion::ThresholdReached { remaining } => self.exit_multi_instance(task, remaining),
        }
    }

    /// Contract a multi-instance task: one exit delta for every instance
    /// token, then deal with the instances still running.
    fn exit_multi_instance(&mut self, task: &str, remaining: Vec<InstanceId>) -> EngineResult<()> {
        let own = self.state.marking.instances_at(task);
        let plan =
            self.firing
                .plan_exit(task, &self.state.marking, &self.state.data, &own)?;
        self.state.marking.apply_delta(&plan.delta)?;

        let Some(activation) = self.state.multi_instance.contract(task) else {
            return Err(EngineError::NotMultiInstance {
                task: task.to_string(),
            });
        };

        for instance in remaining {
            let Some(child) = self.state.work_items.for_instance(task, instance).cloned() else {
                continue;
            };
            match activation.policy {
                RemainingInstancePolicy::ForceComplete => {
                    if child.state == WorkItemState::Fired {
                        self.transition(child.id, WorkItemEvent::Start, ChangeReason::ThresholdReached)?;
                    }
                    self.transition(child.id, WorkItemEvent::Complete, ChangeReason::ThresholdReached)?;
                }
                RemainingInstancePolicy::Abandon => {
                    if let Some(w) = self.state.work_items.get_mut(child.id) {
                        w.detached = true;
                    }
                }
            }
        }

        if self.state.work_items.get(activation.parent).is_some_and(WorkItem::is_live) {
            self.transition(activation.parent, WorkItemEvent::Complete, ChangeReason::Engine)?;
        }
        self.apply_cancellation(task, &plan)?;
        self.push_exit(task, &plan);
        Ok(())
    }

    /// Cancel the work items hit by an exit's cancellation set. Their tokens
    /// already left the marking with the exit delta.
    fn apply_cancellation(&mut self, exiting: &str, plan: &ExitPlan) -> EngineResult<()> {
        for (task, instance) in &plan.cancelled_instances {
            if let Some(item) = self.state.work_items.for_instance(task, *instance).cloned() {
                self.transition(item.id, WorkItemEvent::Cancel, ChangeReason::CancellationRegion)?;
            }
        }
        for task in &plan.cancelled_tasks {
            if task == exiting {
                continue;
            }
            if let Some(item) = self.state.work_items.enabled_for(task).cloned() {
                self.transition(item.id, WorkItemEvent::Cancel, ChangeReason::CancellationRegion)?;
            }
            self.cancel_activation(task, ChangeReason::CancellationRegion)?;
        }
        if !plan.cancelled_instances.is_empty() {
            tracing::info!(
                case_id = %self.state.id,
                task = exiting,
                cancelled = plan.cancelled_instances.len(),
                "Cancellation region cleared"
            );
        }
        Ok(())
    }

    /// Tear down a multi-instance activation (and any abandoned instances of
    /// the task): remove its instance tokens and cancel every live child and
    /// the parent.
    fn cancel_activation(&mut self, task: &str, reason: ChangeReason) -> EngineResult<()> {
        let mut delta = MarkingDelta::new();
        for instance in self.state.marking.instances_at(task) {
            let token = Token::instance(task, instance);
            let n = self.state.marking.count(&token);
            delta.remove(token, n);
        }
        self.state.marking.apply_delta(&delta)?;

        let activation = self.state.multi_instance.contract(task);
        let mut doomed: Vec<WorkItemId> = self
            .state
            .work_items
            .live()
            .filter(|w| w.task_id == task && w.detached)
            .map(|w| w.id)
            .collect();
        if let Some(activation) = &activation {
            doomed.extend(
                self.state
                    .work_items
                    .children(activation.parent)
                    .into_iter()
                    .filter(|w| w.is_live())
                    .map(|w| w.id),
            );
        }
        for id in doomed {
            self.transition(id, WorkItemEvent::Cancel, reason.clone())?;
        }
        if let Some(activation) = activation {
            if self.state.work_items.get(activation.parent).is_some_and(WorkItem::is_live) {
                self.transition(activation.parent, WorkItemEvent::Cancel, reason)?;
            }
        }
        Ok(())
    }

    fn push_exit(&mut self, task: &str, plan: &ExitPlan) {
        self.events.push(EngineEvent::TaskExited {
            case_id: self.state.id,
            task_id: task.to_string(),
            routed_to: plan.routed_to.clone(),
            cancelled: plan.cancelled_instances.len(),
        });
        tracing::debug!(
            case_id = %self.state.id,
            task,
            routed = ?plan.routed_to,
            "Task exited"
        );
    }

    // ─── Helpers ──────────────────────────────────────────────

    fn transition(
        &mut self,
        id: WorkItemId,
        event: WorkItemEvent,
        reason: ChangeReason,
    ) -> EngineResult<WorkItem> {
        let from = self.state.work_items.state_of(id)?;
        let item = self.state.work_items.transition(id, event)?;
        self.events.push(EngineEvent::WorkItemStateChanged {
            case_id: self.state.id,
            work_item_id: id,
            task_id: item.task_id.clone(),
            from,
            to: item.state,
            reason,
        });
        Ok(item)
    }

    /// A live (non-terminal) item of this case, or the error a request for
    /// `event` on it deserves. Resolved before the case status is checked, so
    /// a finished item answers `IllegalTransition` even on a finished case.
    fn live_item(&self, id: WorkItemId, event: WorkItemEvent) -> EngineResult<WorkItem> {
        if id.case_id != self.state.id {
            return Err(EngineError::UnknownWorkItem { id });
        }
        match self.state.work_items.get(id) {
            Some(item) if item.is_live() => Ok(item.clone()),
            _ => {
                let from = self.state.work_items.state_of(id)?;
                Err(EngineError::IllegalTransition { id, from, event })
            }
        }
    }

    fn instance_of(&self, item: &WorkItem) -> EngineResult<InstanceId> {
        item.instance_id.ok_or_else(|| EngineError::InvalidSpecification {
            reason: format!("work item {} of task {} holds no instance", item.id, item.task_id),
        })
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.state.is_running() {
            Ok(())
        } else {
            Err(EngineError::CaseNotRunning {
                id: self.state.id,
                status: self.state.status.clone(),
            })
        }
    }

    /// Running and not suspended.
    fn ensure_accepting(&self) -> EngineResult<()> {
        self.ensure_running()?;
        if self.state.suspended {
            return Err(EngineError::CaseSuspended { id: self.state.id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::DataGuardEvaluator;
    use crate::specification::{Flow, SpecificationBuilder, Task};
    use crate::types::{CaseId, JoinType, SplitType};

    /// i -> A (AND-split) -> B, C -> D (AND-join) -> o
    fn s1() -> Specification {
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

    fn run<T>(
        spec: &Specification,
        state: CaseState,
        op: impl FnOnce(&mut Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<Committed<T>> {
        let guards = DataGuardEvaluator;
        let config = EngineConfig::default();
        let mut tx = Transaction::begin(spec, &guards, &config, state);
        let value = op(&mut tx)?;
        tx.settle()?;
        Ok(tx.finish(value))
    }

    fn enabled_id(state: &CaseState, task: &str) -> WorkItemId {
        state.work_items.enabled_for(task).unwrap().id
    }

    #[test]
    fn start_enables_first_task() {
        let spec = s1();
        let state = CaseState::new(CaseId::new(), "s1".into(), CaseData::new());
        let c = run(&spec, state, |tx| tx.start_case()).unwrap();
        assert_eq!(c.enabled.len(), 1);
        assert_eq!(c.enabled[0].task_id, "A");
        assert!(matches!(c.events[0], EngineEvent::CaseStarted { .. }));
        assert_eq!(c.state.marking.tokens_at("i"), 1);
    }

    #[test]
    fn completing_enabled_item_fast_forwards() {
        let spec = s1();
        let state = CaseState::new(CaseId::new(), "s1".into(), CaseData::new());
        let state = run(&spec, state, |tx| tx.start_case()).unwrap().state;
        let a = enabled_id(&state, "A");

        let c = run(&spec, state, |tx| tx.complete_work_item(a, CaseData::new())).unwrap();
        let transitions: Vec<(WorkItemState, ChangeReason)> = c
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::WorkItemStateChanged { work_item_id, to, reason, .. }
                    if *work_item_id == a =>
                {
                    Some((*to, reason.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (WorkItemState::Fired, ChangeReason::FastForward),
                (WorkItemState::Executing, ChangeReason::FastForward),
                (WorkItemState::Completed, ChangeReason::Requested),
            ]
        );
        let mut tasks: Vec<_> = c.enabled.iter().map(|w| w.task_id.clone()).collect();
        tasks.sort();
        assert_eq!(tasks, vec!["B", "C"]);
    }

    #[test]
    fn failed_command_leaves_original_state() {
        let spec = s1();
        let state = CaseState::new(CaseId::new(), "s1".into(), CaseData::new());
        let state = run(&spec, state, |tx| tx.start_case()).unwrap().state;
        let a = enabled_id(&state, "A");
        let before = state.snapshot();

        let err = run(&spec, state.clone(), |tx| {
            tx.complete_work_item(a, CaseData::new())?;
            Err::<(), _>(EngineError::EngineShutdown)
        });
        assert!(err.is_err());
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn suspended_case_rejects_work() {
        let spec = s1();
        let state = CaseState::new(CaseId::new(), "s1".into(), CaseData::new());
        let state = run(&spec, state, |tx| tx.start_case()).unwrap().state;
        let a = enabled_id(&state, "A");
        let state = run(&spec, state, |tx| tx.suspend()).unwrap().state;
        let err = run(&spec, state, |tx| tx.start_work_item(a)).err().unwrap();
        assert!(matches!(err, EngineError::CaseSuspended { .. }));
    }
}
