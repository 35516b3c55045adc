//! Dependency graph derived from handle declarations.
//!
//! Nodes are actions (by registration index), edges connect the producer of
//! a handle to each of its consumers and carry that handle. The graph is
//! rebuilt for every dispatch, restricted to what the targets need.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use tracing::debug;

use crate::dispatcher::Registration;
use crate::error::DispatchError;
use crate::handle::{AnyHandle, HandleId};

pub(crate) type ActionGraph = DiGraph<usize, AnyHandle>;

pub(crate) struct Plan {
    pub graph: ActionGraph,
    /// Registration indices, producers before consumers.
    pub order: Vec<usize>,
}

impl Plan {
    /// Registration indices of every action `index` transitively depends on,
    /// in ascending order.
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        let Some(start) = self.graph.node_indices().find(|&node| self.graph[node] == index) else {
            return Vec::new();
        };

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut deps = Vec::new();

        while let Some(node) = dfs.next(reversed) {
            if node != start {
                deps.push(self.graph[node]);
            }
        }

        deps.sort_unstable();
        deps
    }
}

/// Collects every action the targets transitively require and orders them.
/// Nothing is executed if this fails.
pub(crate) fn plan(
    actions: &[Registration],
    producers: &HashMap<HandleId, usize>,
    targets: &[AnyHandle],
) -> Result<Plan, DispatchError> {
    let mut required = vec![false; actions.len()];
    let mut stack = Vec::new();

    let mut require = |handle: &AnyHandle, stack: &mut Vec<usize>| {
        if handle.is_provided() {
            return Ok(());
        }

        match producers.get(&handle.id()) {
            Some(&index) => {
                if !required[index] {
                    required[index] = true;
                    stack.push(index);
                }
                Ok(())
            }
            None => Err(DispatchError::NoProducer(handle.describe())),
        }
    };

    for target in targets {
        require(target, &mut stack)?;
    }

    while let Some(index) = stack.pop() {
        for input in &actions[index].inputs {
            require(input, &mut stack)?;
        }
    }

    let selected = (0..actions.len()).filter(|&i| required[i]);
    let graph = build(actions, producers, selected);

    debug!(
        actions = graph.node_count(),
        edges = graph.edge_count(),
        "dependency graph"
    );

    check_cycles(actions, &graph)?;

    let order = stable_order(&graph);
    Ok(Plan { graph, order })
}

/// Graph over the given subset of actions. Nodes and edges are added in the
/// order of `selected` and of each action's inputs, so two builds over the
/// same registry are identical.
pub(crate) fn build(
    actions: &[Registration],
    producers: &HashMap<HandleId, usize>,
    selected: impl IntoIterator<Item = usize>,
) -> ActionGraph {
    let mut graph = ActionGraph::new();
    let mut nodes = Vec::new();
    let mut lookup = HashMap::new();

    for index in selected {
        let node = graph.add_node(index);
        nodes.push((index, node));
        lookup.insert(index, node);
    }

    for (consumer, target) in nodes {
        for input in &actions[consumer].inputs {
            let Some(producer) = producers.get(&input.id()) else {
                continue;
            };

            if let Some(&source) = lookup.get(producer) {
                graph.add_edge(source, target, input.clone());
            }
        }
    }

    graph
}

fn check_cycles(actions: &[Registration], graph: &ActionGraph) -> Result<(), DispatchError> {
    // We run toposort primarily to detect cycles, the order itself comes from
    // `stable_order` below.
    if toposort(graph, None).is_ok() {
        return Ok(());
    }

    let mut members: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|node| graph[node])
        .collect();

    members.sort_unstable();

    let names = members
        .into_iter()
        .map(|index| actions[index].name.clone())
        .collect();

    Err(DispatchError::CyclicDependency(names))
}

/// Kahn's algorithm where ties go to the earliest registered action, so the
/// execution order is reproducible.
fn stable_order(graph: &ActionGraph) -> Vec<usize> {
    let mut pending: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|node| (node, graph.edges_directed(node, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(&node, _)| Reverse((graph[node], node)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(Reverse((index, node))) = ready.pop() {
        order.push(index);

        for edge in graph.edges_directed(node, Direction::Outgoing) {
            if let Some(count) = pending.get_mut(&edge.target()) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse((graph[edge.target()], edge.target())));
                }
            }
        }
    }

    order
}
