//! Join and split semantics: which tasks are enabled by a marking, and the
//! marking delta produced when a task fires or exits.
//!
//! Everything here is a pure function of (specification, marking, case data).
//! The case controller applies the resulting deltas.

use crate::error::{EngineError, EngineResult};
use crate::guard::GuardEvaluator;
use crate::marking::{Marking, MarkingDelta};
use crate::specification::{Element, Flow, Specification};
use crate::types::{CaseData, ConditionKind, ElementId, InstanceId, JoinType, SplitType, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ─── Enablement ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum EnablementReason {
    Enabled,
    NoTokens,
    MissingInputs { missing: Vec<ElementId> },
    GuardsUnsatisfied,
    OrJoinWaiting { pending: Vec<ElementId> },
    Busy,
    UnknownTask,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Enablement {
    pub enabled: bool,
    pub reason: EnablementReason,
    /// Input conditions the firing would consume, in declaration order.
    consumes: Vec<ElementId>,
}

impl Enablement {
    fn enabled(consumes: Vec<ElementId>) -> Self {
        Self {
            enabled: true,
            reason: EnablementReason::Enabled,
            consumes,
        }
    }

    fn blocked(reason: EnablementReason) -> Self {
        Self {
            enabled: false,
            reason,
            consumes: Vec::new(),
        }
    }

    pub fn consumes(&self) -> &[ElementId] {
        &self.consumes
    }
}

// ─── Exit plan ────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct ExitPlan {
    pub delta: MarkingDelta,
    /// Instances of other tasks whose tokens the cancellation set removes.
    pub cancelled_instances: Vec<(ElementId, InstanceId)>,
    /// Tasks named in the cancellation set (their Enabled items are withdrawn).
    pub cancelled_tasks: BTreeSet<ElementId>,
    /// Conditions receiving a token from the split.
    pub routed_to: Vec<ElementId>,
}

// ─── Engine ───────────────────────────────────────────────────

pub struct FiringEngine<'a> {
    spec: &'a Specification,
    guards: &'a dyn GuardEvaluator,
}

impl<'a> FiringEngine<'a> {
    pub fn new(spec: &'a Specification, guards: &'a dyn GuardEvaluator) -> Self {
        Self { spec, guards }
    }

    pub fn enablement(&self, task: &str, marking: &Marking, data: &CaseData) -> Enablement {
        let Ok(t) = self.spec.task(task) else {
            return Enablement::blocked(EnablementReason::UnknownTask);
        };
        if marking.tokens_at(task) > 0 {
            return Enablement::blocked(EnablementReason::Busy);
        }
        let inputs = self.spec.incoming_flows(task).unwrap_or(&[]);
        let marked: Vec<&Flow> = inputs.iter().filter(|f| marking.is_marked(&f.from)).collect();
        if marked.is_empty() {
            return Enablement::blocked(EnablementReason::NoTokens);
        }

        match t.join {
            JoinType::And => {
                let missing: Vec<ElementId> = inputs
                    .iter()
                    .filter(|f| !marking.is_marked(&f.from))
                    .map(|f| f.from.clone())
                    .collect();
                if missing.is_empty() {
                    Enablement::enabled(inputs.iter().map(|f| f.from.clone()).collect())
                } else {
                    Enablement::blocked(EnablementReason::MissingInputs { missing })
                }
            }
            JoinType::Xor => match marked.iter().find(|f| self.flow_holds(f, data)) {
                Some(flow) => Enablement::enabled(vec![flow.from.clone()]),
                None => Enablement::blocked(EnablementReason::GuardsUnsatisfied),
            },
            JoinType::Or => {
                let Ok(scope) = self.spec.or_join_scope(task) else {
                    return Enablement::blocked(EnablementReason::UnknownTask);
                };
                let pending: Vec<ElementId> = inputs
                    .iter()
                    .filter(|f| !marking.is_marked(&f.from))
                    .filter(|f| {
                        scope
                            .upstream_of(&f.from)
                            .is_some_and(|up| up.iter().any(|e| marking.is_marked(e)))
                    })
                    .map(|f| f.from.clone())
                    .collect();
                if pending.is_empty() {
                    Enablement::enabled(marked.iter().map(|f| f.from.clone()).collect())
                } else {
                    Enablement::blocked(EnablementReason::OrJoinWaiting { pending })
                }
            }
        }
    }

    pub fn is_enabled(&self, task: &str, marking: &Marking, data: &CaseData) -> bool {
        self.enablement(task, marking, data).enabled
    }

    /// Consume the join's inputs and put one token per instance on the task
    /// place. With no instances the inputs are consumed and nothing is
    /// produced.
    pub fn plan_fire(
        &self,
        task: &str,
        marking: &Marking,
        data: &CaseData,
        instances: &[InstanceId],
    ) -> EngineResult<MarkingDelta> {
        self.spec.task(task)?;
        let enablement = self.enablement(task, marking, data);
        if !enablement.enabled {
            return Err(EngineError::TaskNotEnabled {
                task: task.to_string(),
            });
        }
        let mut delta = MarkingDelta::new();
        for condition in enablement.consumes() {
            delta.remove(Token::condition(condition.clone()), 1);
        }
        for instance in instances {
            delta.add(Token::instance(task, *instance), 1);
        }
        tracing::debug!(
            task,
            consumed = enablement.consumes().len(),
            instances = instances.len(),
            "Planned fire"
        );
        Ok(delta)
    }

    /// Remove the task's own instance tokens, clear its cancellation set and
    /// route through its split, all in one delta.
    pub fn plan_exit(
        &self,
        task: &str,
        marking: &Marking,
        data: &CaseData,
        own: &[InstanceId],
    ) -> EngineResult<ExitPlan> {
        let t = self.spec.task(task)?;
        let mut plan = ExitPlan::default();

        for instance in own {
            let token = Token::instance(task, *instance);
            let n = marking.count(&token).max(1);
            plan.delta.remove(token, n);
        }

        for id in &t.cancellation_set {
            if self.spec.is_task(id) {
                plan.cancelled_tasks.insert(id.clone());
                for instance in marking.instances_at(id) {
                    if id == task && own.contains(&instance) {
                        continue;
                    }
                    let token = Token::instance(id.clone(), instance);
                    let n = marking.count(&token);
                    plan.delta.remove(token, n);
                    plan.cancelled_instances.push((id.clone(), instance));
                }
                // Implicit task->task arcs belong to the task they feed.
                for flow in self.spec.incoming_flows(id)? {
                    let implicit = matches!(
                        self.spec.element(&flow.from)?,
                        Element::Condition(c) if c.kind == ConditionKind::Implicit
                    );
                    if implicit && !t.cancellation_set.contains(&flow.from) {
                        let token = Token::condition(flow.from.clone());
                        let n = marking.count(&token);
                        plan.delta.remove(token, n);
                    }
                }
            } else {
                let token = Token::condition(id.clone());
                let n = marking.count(&token);
                plan.delta.remove(token, n);
            }
        }

        for flow in self.select_outgoing(task, data)? {
            plan.delta.add(Token::condition(flow.to.clone()), 1);
            plan.routed_to.push(flow.to.clone());
        }

        tracing::debug!(
            task,
            routed = plan.routed_to.len(),
            cancelled = plan.cancelled_instances.len(),
            "Planned exit"
        );
        Ok(plan)
    }

    /// Outgoing flows taken by the task's split for the given data.
    pub fn select_outgoing(&self, task: &str, data: &CaseData) -> EngineResult<Vec<&'a Flow>> {
        let split = self.spec.split_type(task)?;
        let flows = self.spec.outgoing_flows(task)?;
        let default = flows.iter().find(|f| f.is_default);
        let mut conditional = flows.iter().filter(|f| !f.is_default);

        match split {
            SplitType::And => Ok(flows.iter().collect()),
            SplitType::Xor => conditional
                .find(|f| self.flow_holds(f, data))
                .or(default)
                .map(|f| vec![f])
                .ok_or_else(|| EngineError::NoOutgoingFlowSatisfied {
                    task: task.to_string(),
                }),
            SplitType::Or => {
                let taken: Vec<&Flow> = conditional.filter(|f| self.flow_holds(f, data)).collect();
                if !taken.is_empty() {
                    return Ok(taken);
                }
                match default {
                    Some(f) => Ok(vec![f]),
                    None => {
                        tracing::debug!(task, "OR-split selected no flow");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn flow_holds(&self, flow: &Flow, data: &CaseData) -> bool {
        flow.predicate
            .as_deref()
            .map_or(true, |p| self.guards.evaluate(p, data))
    }
}
