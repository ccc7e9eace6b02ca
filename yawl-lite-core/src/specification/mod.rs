//! Immutable process specification: tasks, conditions and the flows between
//! them, plus the structural analyses computed once at load time.
//!
//! A `Specification` is built through [`SpecificationBuilder`] or from a
//! [`SpecificationDto`], validated on construction and then shared read-only
//! (`Arc<Specification>`) by every case of that process.

mod builder;
mod dto;
mod scope;

pub use builder::SpecificationBuilder;
pub use dto::{ElementDto, FlowDto, SpecificationDto, SpecificationLoader};
pub use scope::OrJoinScope;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    ConditionKind, CreationMode, ElementId, JoinType, RemainingInstancePolicy, SpecificationId,
    SplitType,
};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ─── Multi-instance parameters ────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceParams {
    pub min: u32,
    pub max: u32,
    pub threshold: u32,
    #[serde(default)]
    pub creation_mode: CreationMode,
    /// Falls back to `EngineConfig::default_remaining_policy` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingInstancePolicy>,
    /// Case-data key holding an array; its length is the input count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_key: Option<String>,
}

impl MultiInstanceParams {
    pub fn new(min: u32, max: u32, threshold: u32) -> Self {
        Self {
            min,
            max,
            threshold,
            creation_mode: CreationMode::Static,
            remaining: None,
            input_key: None,
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.creation_mode = CreationMode::Dynamic;
        self
    }

    pub fn with_remaining(mut self, policy: RemainingInstancePolicy) -> Self {
        self.remaining = Some(policy);
        self
    }

    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = Some(key.into());
        self
    }

    pub(crate) fn validate(&self, task: &str) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidMultiInstanceParams {
            task: task.to_string(),
            reason,
        };
        if self.min < 1 {
            return Err(invalid("min must be at least 1".into()));
        }
        if self.min > self.threshold {
            return Err(invalid(format!(
                "min {} exceeds threshold {}",
                self.min, self.threshold
            )));
        }
        if self.threshold > self.max {
            return Err(invalid(format!(
                "threshold {} exceeds max {}",
                self.threshold, self.max
            )));
        }
        Ok(())
    }
}

// ─── Elements ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: ElementId,
    pub join: JoinType,
    pub split: SplitType,
    pub multi_instance: Option<MultiInstanceParams>,
    pub cancellation_set: BTreeSet<ElementId>,
    /// Routing-only task, fired and completed by the engine itself.
    pub automatic: bool,
}

impl Task {
    /// XOR-join / AND-split, the usual shape of a task with one input and
    /// one output.
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            join: JoinType::default(),
            split: SplitType::default(),
            multi_instance: None,
            cancellation_set: BTreeSet::new(),
            automatic: false,
        }
    }

    pub fn join(mut self, join: JoinType) -> Self {
        self.join = join;
        self
    }

    pub fn split(mut self, split: SplitType) -> Self {
        self.split = split;
        self
    }

    pub fn multi_instance(mut self, params: MultiInstanceParams) -> Self {
        self.multi_instance = Some(params);
        self
    }

    pub fn cancels<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ElementId>,
    {
        self.cancellation_set.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn automatic(mut self) -> Self {
        self.automatic = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub id: ElementId,
    pub kind: ConditionKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub from: ElementId,
    pub to: ElementId,
    pub predicate: Option<String>,
    pub is_default: bool,
    /// Position in declaration order among the flows leaving `from`.
    pub ordering: u32,
}

impl Flow {
    pub fn new(from: impl Into<ElementId>, to: impl Into<ElementId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            predicate: None,
            is_default: false,
            ordering: 0,
        }
    }

    pub fn when(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn default_flow(mut self) -> Self {
        self.is_default = true;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Element<'a> {
    Task(&'a Task),
    Condition(&'a Condition),
}

// ─── Specification ────────────────────────────────────────────

#[derive(Debug)]
pub struct Specification {
    id: SpecificationId,
    name: Option<String>,
    tasks: HashMap<ElementId, Task>,
    conditions: HashMap<ElementId, Condition>,
    /// Declaration order, used for deterministic enablement scans.
    task_order: Vec<ElementId>,
    condition_order: Vec<ElementId>,
    outgoing: HashMap<ElementId, Vec<Flow>>,
    incoming: HashMap<ElementId, Vec<Flow>>,
    input: ElementId,
    output: ElementId,
    graph: DiGraph<ElementId, ()>,
    nodes: HashMap<ElementId, NodeIndex>,
    or_join_scopes: HashMap<ElementId, OrJoinScope>,
}

impl Specification {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn input_condition(&self) -> &str {
        &self.input
    }

    pub fn output_condition(&self) -> &str {
        &self.output
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.task_order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Conditions in declaration order, implicit conditions last.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> + '_ {
        self.condition_order
            .iter()
            .filter_map(|id| self.conditions.get(id))
    }

    pub fn element(&self, id: &str) -> EngineResult<Element<'_>> {
        if let Some(task) = self.tasks.get(id) {
            return Ok(Element::Task(task));
        }
        self.conditions
            .get(id)
            .map(Element::Condition)
            .ok_or_else(|| unknown(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn task(&self, id: &str) -> EngineResult<&Task> {
        self.tasks.get(id).ok_or_else(|| unknown(id))
    }

    pub fn is_task(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn outgoing_flows(&self, id: &str) -> EngineResult<&[Flow]> {
        self.ensure_known(id)?;
        Ok(self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn incoming_flows(&self, id: &str) -> EngineResult<&[Flow]> {
        self.ensure_known(id)?;
        Ok(self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn join_type(&self, task: &str) -> EngineResult<JoinType> {
        Ok(self.task(task)?.join)
    }

    pub fn split_type(&self, task: &str) -> EngineResult<SplitType> {
        Ok(self.task(task)?.split)
    }

    pub fn cancellation_set(&self, task: &str) -> EngineResult<&BTreeSet<ElementId>> {
        Ok(&self.task(task)?.cancellation_set)
    }

    pub fn is_multi_instance(&self, task: &str) -> EngineResult<bool> {
        Ok(self.task(task)?.multi_instance.is_some())
    }

    pub fn multi_instance_params(&self, task: &str) -> EngineResult<Option<&MultiInstanceParams>> {
        Ok(self.task(task)?.multi_instance.as_ref())
    }

    // ── Structural accessors ──

    /// The net as a petgraph graph, node weights are element ids.
    pub fn graph(&self) -> &DiGraph<ElementId, ()> {
        &self.graph
    }

    pub fn is_reachable(&self, from: &str, to: &str) -> EngineResult<bool> {
        let a = self.node(from)?;
        let b = self.node(to)?;
        Ok(petgraph::algo::has_path_connecting(&self.graph, a, b, None))
    }

    /// Precomputed backward scope of an OR-join task.
    pub fn or_join_scope(&self, task: &str) -> EngineResult<&OrJoinScope> {
        let t = self.task(task)?;
        if t.join != JoinType::Or {
            return Err(EngineError::InvalidSpecification {
                reason: format!("task {task} is not an OR-join"),
            });
        }
        self.or_join_scopes.get(task).ok_or_else(|| unknown(task))
    }

    fn node(&self, id: &str) -> EngineResult<NodeIndex> {
        self.nodes.get(id).copied().ok_or_else(|| unknown(id))
    }

    fn ensure_known(&self, id: &str) -> EngineResult<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(unknown(id))
        }
    }
}

fn unknown(id: &str) -> EngineError {
    EngineError::UnknownElement { id: id.to_string() }
}
