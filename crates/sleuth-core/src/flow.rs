use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of a node in an editable flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Entry point carrying the investigator-supplied seed value.
    Seed,
    /// An enrichment step backed by a registered transform.
    Transform,
}

/// A node in the flow graph as drawn in the editor. Immutable once a flow
/// is compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Unique identifier within the graph.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Named outputs this node produces, JSON-schema shaped.
    #[serde(default)]
    pub outputs_schema: serde_json::Value,
    /// Declared parameters, JSON-schema shaped.
    #[serde(default)]
    pub params_schema: serde_json::Value,
    /// Parameter values set in the editor.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A directed edge. `source_handle` selects which named output of `source`
/// feeds `target_handle` on `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default = "default_handle")]
    pub source_handle: String,
    #[serde(default = "default_handle")]
    pub target_handle: String,
}

fn default_handle() -> String {
    "value".to_string()
}

/// Execution state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// Reference to a named output of an upstream step, recorded from the
/// originating edge's handle pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRef {
    pub source: String,
    pub handle: String,
}

/// One executable step inside a compiled branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    pub node_id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Input bindings keyed by this step's target handle.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputRef>,
    /// Sample outputs at compile time; real outputs once executed.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub status: StepStatus,
    pub branch_id: String,
    pub depth: usize,
}

/// One linear, cycle-free execution path through a compiled flow graph.
///
/// Invariants: no node id repeats within `steps`, and `depth` is strictly
/// increasing along the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowBranch {
    pub id: String,
    pub name: String,
    pub steps: Vec<FlowStep>,
}

impl FlowBranch {
    /// Registered transform key for a transform step: explicit
    /// `params["transform"]` wins, otherwise the node id with a trailing
    /// `-<n>` instance suffix stripped (`whois_lookup-2` -> `whois_lookup`).
    pub fn transform_key(step: &FlowStep) -> String {
        if let Some(serde_json::Value::String(name)) = step.params.get("transform") {
            return name.clone();
        }
        match step.node_id.rsplit_once('-') {
            Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base.to_string(),
            _ => step.node_id.clone(),
        }
    }
}
