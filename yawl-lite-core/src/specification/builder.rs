use super::scope::{compute_or_join_scopes, ScopeInputs};
use super::{Condition, Flow, Specification, Task};
use crate::error::{EngineError, EngineResult};
use crate::types::{ConditionKind, ElementId, SpecificationId};
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};

/// Programmatic construction of a [`Specification`].
///
/// Elements and flows are collected as declared; `build()` validates the
/// whole net, inserts implicit conditions for direct task → task flows and
/// computes the OR-join scopes.
#[derive(Debug, Clone, Default)]
pub struct SpecificationBuilder {
    id: SpecificationId,
    name: Option<String>,
    conditions: Vec<Condition>,
    tasks: Vec<Task>,
    flows: Vec<Flow>,
}

impl SpecificationBuilder {
    pub fn new(id: impl Into<SpecificationId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input_condition(self, id: impl Into<ElementId>) -> Self {
        self.condition_of_kind(id, ConditionKind::Input)
    }

    pub fn output_condition(self, id: impl Into<ElementId>) -> Self {
        self.condition_of_kind(id, ConditionKind::Output)
    }

    pub fn condition(self, id: impl Into<ElementId>) -> Self {
        self.condition_of_kind(id, ConditionKind::Intermediate)
    }

    pub fn condition_of_kind(mut self, id: impl Into<ElementId>, kind: ConditionKind) -> Self {
        self.conditions.push(Condition {
            id: id.into(),
            kind,
        });
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Flows keep their declaration order; `ordering` is assigned by `build()`.
    pub fn flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn build(self) -> EngineResult<Specification> {
        for task in &self.tasks {
            if let Some(params) = &task.multi_instance {
                params.validate(&task.id)?;
            }
        }

        let violations = validate(&self);
        if !violations.is_empty() {
            return Err(EngineError::invalid(violations.join("; ")));
        }

        let SpecificationBuilder {
            id,
            name,
            mut conditions,
            tasks,
            flows,
        } = self;

        let task_ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut taken: HashSet<ElementId> = task_ids.iter().map(|s| s.to_string()).collect();
        taken.extend(conditions.iter().map(|c| c.id.clone()));

        // Every direct task → task flow is split around an implicit condition.
        // The predicate and default flag stay on the split side.
        let mut expanded = Vec::with_capacity(flows.len());
        for flow in flows {
            if task_ids.contains(flow.from.as_str()) && task_ids.contains(flow.to.as_str()) {
                let implicit = format!("{}->{}", flow.from, flow.to);
                if !taken.insert(implicit.clone()) {
                    return Err(EngineError::invalid(format!(
                        "implicit condition id {implicit} collides with a declared element"
                    )));
                }
                conditions.push(Condition {
                    id: implicit.clone(),
                    kind: ConditionKind::Implicit,
                });
                expanded.push(Flow {
                    from: flow.from,
                    to: implicit.clone(),
                    predicate: flow.predicate,
                    is_default: flow.is_default,
                    ordering: 0,
                });
                expanded.push(Flow::new(implicit, flow.to));
            } else {
                expanded.push(flow);
            }
        }

        let mut outgoing: HashMap<ElementId, Vec<Flow>> = HashMap::new();
        let mut incoming: HashMap<ElementId, Vec<Flow>> = HashMap::new();
        for mut flow in expanded {
            let slot = outgoing.entry(flow.from.clone()).or_default();
            flow.ordering = slot.len() as u32;
            slot.push(flow.clone());
            incoming.entry(flow.to.clone()).or_default().push(flow);
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for task in &tasks {
            nodes.insert(task.id.clone(), graph.add_node(task.id.clone()));
        }
        for condition in &conditions {
            nodes.insert(condition.id.clone(), graph.add_node(condition.id.clone()));
        }
        for flows in outgoing.values() {
            for flow in flows {
                if let (Some(&a), Some(&b)) = (nodes.get(&flow.from), nodes.get(&flow.to)) {
                    graph.add_edge(a, b, ());
                }
            }
        }

        let or_join_scopes = compute_or_join_scopes(ScopeInputs {
            graph: &graph,
            nodes: &nodes,
            tasks: &tasks,
            incoming: &incoming,
        });

        let input = find_kind(&conditions, ConditionKind::Input)?;
        let output = find_kind(&conditions, ConditionKind::Output)?;

        Ok(Specification {
            id,
            name,
            task_order: tasks.iter().map(|t| t.id.clone()).collect(),
            condition_order: conditions.iter().map(|c| c.id.clone()).collect(),
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            conditions: conditions.into_iter().map(|c| (c.id.clone(), c)).collect(),
            outgoing,
            incoming,
            input,
            output,
            graph,
            nodes,
            or_join_scopes,
        })
    }
}

fn find_kind(conditions: &[Condition], kind: ConditionKind) -> EngineResult<ElementId> {
    conditions
        .iter()
        .find(|c| c.kind == kind)
        .map(|c| c.id.clone())
        .ok_or_else(|| EngineError::invalid(format!("no {kind:?} condition")))
}

/// Structural checks over the declared net. Returns every violation found,
/// each prefixed with its rule code.
fn validate(b: &SpecificationBuilder) -> Vec<String> {
    let mut errors = Vec::new();

    // V1: element ids are unique across tasks and conditions
    let mut kinds: HashMap<&str, Option<ConditionKind>> = HashMap::new();
    for task in &b.tasks {
        if kinds.insert(task.id.as_str(), None).is_some() {
            errors.push(format!("[V1] duplicate element id: {}", task.id));
        }
    }
    for condition in &b.conditions {
        if kinds
            .insert(condition.id.as_str(), Some(condition.kind))
            .is_some()
        {
            errors.push(format!("[V1] duplicate element id: {}", condition.id));
        }
    }

    // V2 + V3: exactly one input and one output condition
    for (rule, kind) in [("V2", ConditionKind::Input), ("V3", ConditionKind::Output)] {
        let count = b.conditions.iter().filter(|c| c.kind == kind).count();
        if count != 1 {
            errors.push(format!(
                "[{rule}] expected exactly one {kind:?} condition, found {count}"
            ));
        }
    }

    let mut seen_flows = HashSet::new();
    let mut defaults: HashMap<&str, usize> = HashMap::new();
    let mut has_in: HashSet<&str> = HashSet::new();
    let mut has_out: HashSet<&str> = HashSet::new();

    for flow in &b.flows {
        let from = kinds.get(flow.from.as_str());
        let to = kinds.get(flow.to.as_str());

        // V4: endpoints exist
        if from.is_none() {
            errors.push(format!("[V4] flow source {} does not exist", flow.from));
        }
        if to.is_none() {
            errors.push(format!("[V4] flow target {} does not exist", flow.to));
        }
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };

        // V5: nothing flows into the input or out of the output condition
        if *to == Some(ConditionKind::Input) {
            errors.push(format!("[V5] flow {} -> {} enters the input condition", flow.from, flow.to));
        }
        if *from == Some(ConditionKind::Output) {
            errors.push(format!("[V5] flow {} -> {} leaves the output condition", flow.from, flow.to));
        }

        // V6: conditions only connect to tasks
        if from.is_some() && to.is_some() {
            errors.push(format!(
                "[V6] flow {} -> {} connects two conditions",
                flow.from, flow.to
            ));
        }

        // V7: no parallel duplicate flows
        if !seen_flows.insert((flow.from.as_str(), flow.to.as_str())) {
            errors.push(format!("[V7] duplicate flow {} -> {}", flow.from, flow.to));
        }

        // V8: default flows leave tasks, at most one per split
        if flow.is_default {
            if from.is_some() {
                errors.push(format!(
                    "[V8] default flow {} -> {} does not leave a task",
                    flow.from, flow.to
                ));
            }
            *defaults.entry(flow.from.as_str()).or_default() += 1;
        }

        has_out.insert(flow.from.as_str());
        has_in.insert(flow.to.as_str());
    }
    for (task, count) in defaults {
        if count > 1 {
            errors.push(format!("[V8] task {task} declares {count} default flows"));
        }
    }

    for task in &b.tasks {
        // V9: cancellation sets reference known elements
        for id in &task.cancellation_set {
            if !kinds.contains_key(id.as_str()) {
                errors.push(format!(
                    "[V9] cancellation set of {} names unknown element {}",
                    task.id, id
                ));
            }
        }

        // V10: every task sits on a path
        if !has_in.contains(task.id.as_str()) {
            errors.push(format!("[V10] task {} has no incoming flow", task.id));
        }
        if !has_out.contains(task.id.as_str()) {
            errors.push(format!("[V10] task {} has no outgoing flow", task.id));
        }

        // V11: automatic tasks are single-instance
        if task.automatic && task.multi_instance.is_some() {
            errors.push(format!(
                "[V11] automatic task {} cannot be multi-instance",
                task.id
            ));
        }
    }

    errors
}
