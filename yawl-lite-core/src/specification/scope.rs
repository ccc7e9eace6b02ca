use super::{Flow, Task};
use crate::types::{ElementId, JoinType};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, NodeFiltered, Reversed};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Backward scope of an OR-join: for each input condition, every element
/// that can still deliver a token to it without passing through the join.
///
/// An unmarked input whose scope holds no token can never become marked, so
/// the join need not wait for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrJoinScope {
    per_input: BTreeMap<ElementId, BTreeSet<ElementId>>,
}

impl OrJoinScope {
    pub fn upstream_of(&self, input: &str) -> Option<&BTreeSet<ElementId>> {
        self.per_input.get(input)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.per_input.keys().map(String::as_str)
    }
}

pub(super) struct ScopeInputs<'a> {
    pub graph: &'a DiGraph<ElementId, ()>,
    pub nodes: &'a HashMap<ElementId, NodeIndex>,
    pub tasks: &'a [Task],
    pub incoming: &'a HashMap<ElementId, Vec<Flow>>,
}

pub(super) fn compute_or_join_scopes(inputs: ScopeInputs<'_>) -> HashMap<ElementId, OrJoinScope> {
    let mut scopes = HashMap::new();
    for task in inputs.tasks.iter().filter(|t| t.join == JoinType::Or) {
        let Some(&join) = inputs.nodes.get(&task.id) else {
            continue;
        };
        // Walk the reversed net with the join itself removed, so cycles back
        // through the join do not count as pending work.
        let reversed = Reversed(inputs.graph);
        let view = NodeFiltered::from_fn(reversed, |n: NodeIndex| n != join);

        let mut per_input = BTreeMap::new();
        for flow in inputs.incoming.get(&task.id).into_iter().flatten() {
            let Some(&start) = inputs.nodes.get(&flow.from) else {
                continue;
            };
            let mut upstream = BTreeSet::new();
            let mut bfs = Bfs::new(&view, start);
            while let Some(nx) = bfs.next(&view) {
                upstream.insert(inputs.graph[nx].clone());
            }
            per_input.insert(flow.from.clone(), upstream);
        }
        tracing::debug!(
            task = %task.id,
            inputs = per_input.len(),
            "Computed OR-join scope"
        );
        scopes.insert(task.id.clone(), OrJoinScope { per_input });
    }
    scopes
}
