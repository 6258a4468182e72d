//! Graph kernel — pure functions over a [`Dag`], no I/O.
//!
//! Rules enforced by [`validate`]:
//! 1. Node IDs must be unique within the graph.
//! 2. Every edge must reference existing node IDs (both `source` and `target`).
//! 3. At least one `start` node, none of them with incoming edges.
//! 4. At least one `output` node.
//! 5. The directed graph must be acyclic.
//! 6. Every `start` node reaches some `output` node.
//! 7. Node payloads are well-formed for their type; unknown types are rejected.
//!
//! All broken rules are reported together.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::{
    EngineError,
    models::{Dag, Node},
};

/// Index-based adjacency over the nodes of a [`Dag`]. Edges with an
/// unknown endpoint are left out; [`validate`] reports them separately.
struct Graph<'a> {
    index: HashMap<&'a str, usize>,
    outgoing: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl<'a> Graph<'a> {
    fn build(dag: &'a Dag) -> Self {
        let mut index = HashMap::with_capacity(dag.nodes.len());
        for (i, node) in dag.nodes.iter().enumerate() {
            index.entry(node.id.as_str()).or_insert(i);
        }

        let mut outgoing = vec![Vec::new(); dag.nodes.len()];
        let mut in_degree = vec![0; dag.nodes.len()];
        for edge in &dag.edges {
            if let (Some(&from), Some(&to)) =
                (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
            {
                outgoing[from].push(to);
                in_degree[to] += 1;
            }
        }

        Self { index, outgoing, in_degree }
    }

    fn reachable(&self, from: usize, to: &HashSet<usize>) -> bool {
        let mut seen = vec![false; self.outgoing.len()];
        let mut queue = VecDeque::from([from]);
        seen[from] = true;
        while let Some(current) = queue.pop_front() {
            if to.contains(&current) {
                return true;
            }
            for &next in &self.outgoing[current] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        false
    }

    fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let mut marks = vec![Mark::New; self.outgoing.len()];
        for root in 0..self.outgoing.len() {
            if marks[root] != Mark::New {
                continue;
            }
            // iterative DFS: (node, next child position)
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::Active;
            while let Some(top) = stack.last_mut() {
                let (node, child) = *top;
                if let Some(&next) = self.outgoing[node].get(child) {
                    top.1 += 1;
                    match marks[next] {
                        Mark::Active => return true,
                        Mark::New => {
                            marks[next] = Mark::Active;
                            stack.push((next, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        false
    }
}

/// Check every graph rule and return all violations. An empty list means
/// the DAG is valid. The order of messages is stable for a given input.
pub fn validate(dag: &Dag) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &dag.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node ID '{}'", node.id));
        }
    }

    for edge in &dag.edges {
        for (id, side) in [(&edge.source, "source"), (&edge.target, "target")] {
            if !seen_ids.contains(id.as_str()) {
                errors.push(format!("Edge references unknown node '{id}' ({side})"));
            }
        }
    }

    let graph = Graph::build(dag);
    let starts: Vec<usize> = indices_of_type(dag, "start");
    let outputs: HashSet<usize> = indices_of_type(dag, "output").into_iter().collect();

    if starts.is_empty() {
        errors.push("DAG must have at least one start node".to_owned());
    }
    for &s in &starts {
        if graph.in_degree[s] > 0 {
            errors.push(format!("Start node '{}' cannot have incoming edges", dag.nodes[s].id));
        }
    }

    if outputs.is_empty() {
        errors.push("DAG must have at least one output node".to_owned());
    }

    if graph.has_cycle() {
        errors.push("DAG contains a cycle".to_owned());
    }

    // without output nodes the missing-output error already covers this
    if !outputs.is_empty() {
        for &s in &starts {
            if !graph.reachable(s, &outputs) {
                errors.push(format!(
                    "Start node '{}' has no path to any output node",
                    dag.nodes[s].id
                ));
            }
        }
    }

    for node in &dag.nodes {
        if let Err(issues) = node.kind() {
            errors.extend(issues.iter().map(|issue| issue.describe(&node.id)));
        }
    }

    errors
}

/// Validate the DAG and return its nodes in topological execution order.
///
/// # Errors
/// - [`EngineError::Validation`] listing every broken rule.
pub fn validate_dag(dag: &Dag) -> Result<Vec<String>, EngineError> {
    let errors = validate(dag);
    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }
    topological_order(dag)
}

/// Kahn's algorithm. Among nodes that are ready at the same time, the one
/// that appears first in `dag.nodes` goes first, so the order is a pure
/// function of the graph.
///
/// # Errors
/// - [`EngineError::CycleDetected`] if not every node could be ordered.
pub fn topological_order(dag: &Dag) -> Result<Vec<String>, EngineError> {
    let graph = Graph::build(dag);
    let mut in_degree = graph.in_degree.clone();

    let mut ready: BTreeSet<usize> = (0..dag.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(dag.nodes.len());

    while let Some(current) = ready.pop_first() {
        sorted.push(dag.nodes[current].id.clone());
        for &next in &graph.outgoing[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if sorted.len() != dag.nodes.len() {
        return Err(EngineError::CycleDetected);
    }
    Ok(sorted)
}

pub fn has_cycle(dag: &Dag) -> bool {
    Graph::build(dag).has_cycle()
}

/// Whether a directed path leads from `from` to `to`. A node reaches itself.
pub fn has_path(dag: &Dag, from: &str, to: &str) -> bool {
    let graph = Graph::build(dag);
    match (graph.index.get(from), graph.index.get(to)) {
        (Some(&a), Some(&b)) => graph.reachable(a, &HashSet::from([b])),
        _ => false,
    }
}

pub fn get_node_by_id<'a>(dag: &'a Dag, id: &str) -> Option<&'a Node> {
    dag.nodes.iter().find(|n| n.id == id)
}

pub fn filter_nodes_by_type<'a>(dag: &'a Dag, node_type: &str) -> Vec<&'a Node> {
    dag.nodes.iter().filter(|n| n.node_type == node_type).collect()
}

fn indices_of_type(dag: &Dag, node_type: &str) -> Vec<usize> {
    dag.nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.node_type == node_type)
        .map(|(i, _)| i)
        .collect()
}
