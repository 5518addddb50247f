use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::flow::{FlowBranch, FlowEdge, FlowNode, FlowStep, InputRef, NodeKind, StepStatus};

/// Distance assigned to nodes whose leaf distance is still being computed
/// (i.e. reachable only back through the cycle being walked).
const UNREACHABLE: usize = usize::MAX / 2;

/// Compile an editable node/edge graph into ordered executable branches.
///
/// From each seed node a depth-first exploration produces one branch per
/// leaf: the shortest outgoing edge continues the current branch, every
/// other edge forks a new one. Nodes already on the current path are never
/// revisited, so every branch is cycle-free. Pure and synchronous, safe
/// to call repeatedly for previews.
pub fn compile(nodes: &[FlowNode], edges: &[FlowEdge], seed_value: &str) -> Vec<FlowBranch> {
    Compiler::new(nodes, edges, seed_value).run()
}

struct Compiler<'a> {
    node_list: &'a [FlowNode],
    nodes: HashMap<&'a str, &'a FlowNode>,
    /// Outgoing edges per source node, original order preserved.
    outgoing: HashMap<&'a str, Vec<&'a FlowEdge>>,
    seed_value: &'a str,
    /// Sample outputs memoized per node id so forked branches stay
    /// consistent.
    samples: HashMap<String, Map<String, Value>>,
    /// Leaf-distance memo, keyed by node id only.
    distances: HashMap<String, usize>,
    in_flight: HashSet<String>,
    /// Forks minted per parent branch id, so ids stay unique when
    /// several nodes along one branch fork.
    fork_counts: HashMap<String, usize>,
    branches: Vec<FlowBranch>,
}

impl<'a> Compiler<'a> {
    fn new(node_list: &'a [FlowNode], edges: &'a [FlowEdge], seed_value: &'a str) -> Self {
        let nodes: HashMap<&str, &FlowNode> =
            node_list.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut outgoing: HashMap<&str, Vec<&FlowEdge>> = HashMap::new();
        for edge in edges {
            // Edges pointing at unknown nodes are dropped up front
            if !nodes.contains_key(edge.target.as_str()) {
                debug!(edge = %edge.id, target = %edge.target, "Dropping edge to unknown node");
                continue;
            }
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
        }

        Self {
            node_list,
            nodes,
            outgoing,
            seed_value,
            samples: HashMap::new(),
            distances: HashMap::new(),
            in_flight: HashSet::new(),
            fork_counts: HashMap::new(),
            branches: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<FlowBranch> {
        let seeds: Vec<&FlowNode> = self
            .node_list
            .iter()
            .filter(|n| n.kind == NodeKind::Seed)
            .collect();

        if seeds.is_empty() {
            return vec![missing_seed_branch()];
        }

        for (index, seed) in seeds.into_iter().enumerate() {
            let branch_id = format!("b{}", index);
            let mut path = Vec::new();
            let mut steps = Vec::new();
            self.walk(seed, None, 0, &branch_id, &mut path, &mut steps);
        }

        // Stable: equal-length branches keep discovery order
        self.branches.sort_by_key(|b| b.steps.len());
        self.branches
    }

    fn walk(
        &mut self,
        node: &'a FlowNode,
        via: Option<&'a FlowEdge>,
        depth: usize,
        branch_id: &str,
        path: &mut Vec<String>,
        steps: &mut Vec<FlowStep>,
    ) {
        let mut inputs = BTreeMap::new();
        if let Some(edge) = via {
            inputs.insert(
                edge.target_handle.clone(),
                InputRef {
                    source: edge.source.clone(),
                    handle: edge.source_handle.clone(),
                },
            );
        }

        steps.push(FlowStep {
            node_id: node.id.clone(),
            kind: node.kind,
            params: node.params.clone(),
            inputs,
            outputs: self.sample_outputs(node),
            status: StepStatus::Pending,
            branch_id: branch_id.to_string(),
            depth,
        });
        path.push(node.id.clone());

        // Valid children: outgoing edges whose target is not already on the
        // current path (would close a cycle), ordered by ascending leaf
        // distance; ties keep original edge order.
        let candidates: Vec<&'a FlowEdge> = self
            .outgoing
            .get(node.id.as_str())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| !path.contains(&e.target))
            .collect();

        let mut children: Vec<(usize, &'a FlowEdge)> = candidates
            .into_iter()
            .map(|e| (self.leaf_distance(&e.target), e))
            .collect();
        children.sort_by_key(|(distance, _)| *distance);

        if children.is_empty() {
            // Leaf: finalize the accumulated steps into one branch
            self.branches.push(FlowBranch {
                id: branch_id.to_string(),
                name: format!("Branch {}", self.branches.len() + 1),
                steps: steps.clone(),
            });
        } else {
            let path_snapshot = path.clone();
            let steps_snapshot = steps.clone();

            for (child_index, (_, edge)) in children.into_iter().enumerate() {
                let Some(target) = self.nodes.get(edge.target.as_str()).copied() else {
                    continue;
                };

                if child_index == 0 {
                    // Shortest edge continues the same branch
                    self.walk(target, Some(edge), depth + 1, branch_id, path, steps);
                } else {
                    // Every other edge forks: copied steps up to and
                    // including this node, own path snapshot so sibling
                    // forks do not block each other
                    let fork_id = self.next_fork_id(branch_id);
                    let mut fork_path = path_snapshot.clone();
                    let mut fork_steps = steps_snapshot.clone();
                    for step in &mut fork_steps {
                        step.branch_id = fork_id.clone();
                    }
                    self.walk(
                        target,
                        Some(edge),
                        depth + 1,
                        &fork_id,
                        &mut fork_path,
                        &mut fork_steps,
                    );
                }
            }
        }

        // Backtrack before returning to the parent frame
        path.pop();
        steps.pop();
    }

    fn next_fork_id(&mut self, branch_id: &str) -> String {
        let counter = self.fork_counts.entry(branch_id.to_string()).or_insert(0);
        *counter += 1;
        format!("{}-{}", branch_id, counter)
    }

    /// Shortest distance from `id` to a leaf. Memoized by node id only,
    /// ignoring the active path: an approximation used purely to order
    /// sibling edges, not to guarantee branch minimality.
    fn leaf_distance(&mut self, id: &str) -> usize {
        if let Some(&distance) = self.distances.get(id) {
            return distance;
        }
        if !self.in_flight.insert(id.to_string()) {
            return UNREACHABLE;
        }

        let children: Vec<&'a FlowEdge> = self.outgoing.get(id).cloned().unwrap_or_default();
        let distance = if children.is_empty() {
            0
        } else {
            children
                .iter()
                .map(|e| self.leaf_distance(&e.target))
                .min()
                .unwrap_or(0)
                .saturating_add(1)
        };

        self.in_flight.remove(id);
        self.distances.insert(id.to_string(), distance);
        distance
    }

    /// Placeholder outputs for preview purposes, computed once per node id
    /// across the whole compile call.
    fn sample_outputs(&mut self, node: &FlowNode) -> Map<String, Value> {
        if let Some(existing) = self.samples.get(&node.id) {
            return existing.clone();
        }

        let mut outputs = Map::new();
        match node.kind {
            NodeKind::Seed => {
                outputs.insert("value".to_string(), json!(self.seed_value));
            }
            NodeKind::Transform => {
                for key in schema_output_keys(&node.outputs_schema) {
                    outputs.insert(key.clone(), json!(format!("{{{}.{}}}", node.id, key)));
                }
                if outputs.is_empty() {
                    outputs.insert(
                        "value".to_string(),
                        json!(format!("{{{}.value}}", node.id)),
                    );
                }
            }
        }

        self.samples.insert(node.id.clone(), outputs.clone());
        outputs
    }
}

/// Named output handles of a node: JSON-schema `properties` keys, or the
/// object's own keys for plain handle maps.
fn schema_output_keys(schema: &Value) -> Vec<String> {
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        return props.keys().cloned().collect();
    }
    match schema.as_object() {
        Some(obj) if !obj.contains_key("type") => obj.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// A flow without any seed node compiles to a single branch holding one
/// error-status step, rather than failing the compile call itself.
fn missing_seed_branch() -> FlowBranch {
    FlowBranch {
        id: "b0".to_string(),
        name: "invalid flow".to_string(),
        steps: vec![FlowStep {
            node_id: "missing-seed".to_string(),
            kind: NodeKind::Seed,
            params: Map::new(),
            inputs: BTreeMap::new(),
            outputs: Map::new(),
            status: StepStatus::Error,
            branch_id: "b0".to_string(),
            depth: 0,
        }],
    }
}
