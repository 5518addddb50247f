use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use sleuth_core::config::VaultConfig;
use sleuth_core::error::{Result, SleuthError};
use sleuth_core::event::EventBus;
use sleuth_core::flow::{FlowBranch, NodeKind, FlowStep};
use sleuth_core::types::{OwnerId, RunEvent, RunId, RunRecord, SketchId};
use sleuth_graph::{serialize_properties, GraphClient};
use sleuth_transforms::{Invocation, StepOutcome, TransformPipeline, TransformRegistry};
use sleuth_vault::SecretVault;

use crate::hooks::{NoopHooks, RunHooks};
use crate::runs::RunStore;

/// What a run executes: one named transform, or a pre-compiled branch
/// list.
#[derive(Debug, Clone)]
pub enum RunPayload {
    Transform { name: String },
    Branches(Vec<FlowBranch>),
}

/// One run submission, dispatched through the task queue.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub sketch_id: SketchId,
    pub owner: Option<OwnerId>,
    pub payload: RunPayload,
    pub values: Vec<String>,
    pub params: Map<String, Value>,
    pub secret_refs: BTreeMap<String, String>,
}

/// Drives one run end to end and owns the run state machine:
/// pending -[submit]-> running -[success]-> completed,
/// running -[exception]-> failed. Terminal states are final; there is no
/// automatic retry.
pub struct RunOrchestrator {
    registry: Arc<TransformRegistry>,
    graph: Arc<dyn GraphClient>,
    runs: Arc<RunStore>,
    events: Arc<EventBus>,
    hooks: Arc<dyn RunHooks>,
    vault_config: VaultConfig,
    vault_path: PathBuf,
    flush_threshold: usize,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<TransformRegistry>,
        graph: Arc<dyn GraphClient>,
        runs: Arc<RunStore>,
        events: Arc<EventBus>,
        vault_config: VaultConfig,
        vault_path: PathBuf,
        flush_threshold: usize,
    ) -> Self {
        Self {
            registry,
            graph,
            runs,
            events,
            hooks: Arc::new(NoopHooks),
            vault_config,
            vault_path,
            flush_threshold,
        }
    }

    /// Replace the post-run hook set.
    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Create the pending run record for a new submission.
    pub fn prepare(&self, sketch_id: &SketchId) -> Result<RunRecord> {
        let record = self.runs.create(sketch_id)?;
        self.events.publish(RunEvent::RunQueued {
            run_id: record.id.clone(),
            sketch_id: sketch_id.clone(),
        });
        Ok(record)
    }

    /// Execute one prepared run. On success the record transitions to
    /// `completed` with transport-safe results; on any escaping error it
    /// transitions to `failed` and the error is re-raised so the task
    /// queue's own status reflects the failure too.
    pub async fn execute_run(&self, request: &RunRequest) -> Result<Value> {
        self.runs.mark_running(&request.run_id)?;
        self.events.publish(RunEvent::RunStarted {
            run_id: request.run_id.clone(),
            sketch_id: request.sketch_id.clone(),
        });
        info!(run_id = %request.run_id, sketch_id = %request.sketch_id, "Run started");

        // Best-effort vault: a missing or malformed master key is logged
        // and the run proceeds without vaulted secrets. Transforms that
        // require one then fail their own validation stage, which points
        // at the actual gap.
        let vault = match SecretVault::open(&self.vault_config, &self.vault_path) {
            Ok(vault) => Some(Arc::new(vault)),
            Err(e) => {
                warn!(error = %e, "Vault unavailable, continuing without vaulted secrets");
                None
            }
        };

        let pipeline = TransformPipeline::new(
            self.graph.clone(),
            vault,
            self.events.clone(),
            self.flush_threshold,
        );

        let outcome = match &request.payload {
            RunPayload::Transform { name } => self.run_single(&pipeline, name, request).await,
            RunPayload::Branches(branches) => {
                self.run_branches(&pipeline, branches, request).await
            }
        };

        match outcome {
            Ok(results) => {
                self.runs.mark_completed(&request.run_id, &results)?;
                self.events.publish(RunEvent::RunCompleted {
                    run_id: request.run_id.clone(),
                    sketch_id: request.sketch_id.clone(),
                });
                info!(run_id = %request.run_id, "Run completed");
                self.fire_hooks(&request.run_id).await;
                Ok(results)
            }
            Err(e) => {
                self.runs.mark_failed(&request.run_id, &e.to_string())?;
                self.events.publish(RunEvent::RunFailed {
                    run_id: request.run_id.clone(),
                    sketch_id: request.sketch_id.clone(),
                    error: e.to_string(),
                });
                warn!(run_id = %request.run_id, error = %e, "Run failed");
                self.fire_hooks(&request.run_id).await;
                Err(e)
            }
        }
    }

    async fn fire_hooks(&self, run_id: &RunId) {
        match self.runs.get(run_id) {
            Ok(Some(record)) => self.hooks.after_run(&record).await,
            Ok(None) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Could not load run for hooks"),
        }
    }

    async fn run_single(
        &self,
        pipeline: &TransformPipeline,
        name: &str,
        request: &RunRequest,
    ) -> Result<Value> {
        let transform = self
            .registry
            .get(name)
            .ok_or_else(|| SleuthError::TransformNotFound(name.to_string()))?;

        let raw_values: Vec<Value> = request.values.iter().map(|v| json!(v)).collect();
        let mut invocation = Invocation::new(raw_values, request.sketch_id.clone())
            .with_params(request.params.clone());
        invocation.secret_refs = request.secret_refs.clone();
        invocation.owner = request.owner.clone();

        let outcome = pipeline.execute(transform.as_ref(), invocation).await?;
        Ok(match outcome {
            StepOutcome::Completed(results) => json!({
                "transform": name,
                "status": "completed",
                "results": transport_results(&results),
            }),
            StepOutcome::Failed { reason } => json!({
                "transform": name,
                "status": "error",
                "error": reason,
                "results": [],
            }),
        })
    }

    async fn run_branches(
        &self,
        pipeline: &TransformPipeline,
        branches: &[FlowBranch],
        request: &RunRequest,
    ) -> Result<Value> {
        let mut branch_reports = Vec::new();

        for branch in branches {
            // Steps run strictly in ascending depth order; branches share
            // nothing with each other during the run.
            let mut steps = branch.steps.clone();
            steps.sort_by_key(|s| s.depth);

            let mut outputs_by_node: HashMap<String, Map<String, Value>> = HashMap::new();
            let mut step_reports = Vec::new();

            for step in &steps {
                match step.kind {
                    NodeKind::Seed => {
                        let mut outputs = Map::new();
                        outputs.insert("value".to_string(), json!(request.values));
                        outputs_by_node.insert(step.node_id.clone(), outputs);
                        step_reports.push(json!({
                            "nodeId": step.node_id,
                            "status": "completed",
                        }));
                    }
                    NodeKind::Transform => {
                        let report = self
                            .run_step(pipeline, step, request, &mut outputs_by_node)
                            .await?;
                        step_reports.push(report);
                    }
                }
            }

            branch_reports.push(json!({
                "branchId": branch.id,
                "name": branch.name,
                "steps": step_reports,
            }));
        }

        Ok(json!({ "branches": branch_reports }))
    }

    async fn run_step(
        &self,
        pipeline: &TransformPipeline,
        step: &FlowStep,
        request: &RunRequest,
        outputs_by_node: &mut HashMap<String, Map<String, Value>>,
    ) -> Result<Value> {
        let key = FlowBranch::transform_key(step);
        let transform = self
            .registry
            .get(&key)
            .ok_or_else(|| SleuthError::TransformNotFound(key.clone()))?;

        // Pull raw inputs from upstream outputs per the originating
        // edge's handle pair
        let mut raw_values = Vec::new();
        for input_ref in step.inputs.values() {
            if let Some(outputs) = outputs_by_node.get(&input_ref.source) {
                if let Some(value) = outputs.get(&input_ref.handle) {
                    raw_values.push(value.clone());
                }
            }
        }

        // The reserved routing key is not a transform parameter
        let mut params = step.params.clone();
        params.remove("transform");

        let mut invocation =
            Invocation::new(raw_values, request.sketch_id.clone()).with_params(params);
        invocation.secret_refs = request.secret_refs.clone();
        invocation.owner = request.owner.clone();

        let outcome = pipeline.execute(transform.as_ref(), invocation).await?;
        Ok(match outcome {
            StepOutcome::Completed(results) => {
                outputs_by_node.insert(step.node_id.clone(), step_outputs(&results));
                json!({
                    "nodeId": step.node_id,
                    "transform": key,
                    "status": "completed",
                    "results": transport_results(&results),
                })
            }
            StepOutcome::Failed { reason } => {
                // Soft failure: downstream steps see no outputs, the
                // branch and run continue
                outputs_by_node.insert(step.node_id.clone(), Map::new());
                json!({
                    "nodeId": step.node_id,
                    "transform": key,
                    "status": "error",
                    "error": reason,
                    "results": [],
                })
            }
        })
    }
}

/// Build the named-output map downstream steps pull from: the full result
/// list under `value`, plus one array per field present in the records.
fn step_outputs(results: &[Value]) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert("value".to_string(), Value::Array(results.to_vec()));

    let mut by_field: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for result in results {
        if let Some(obj) = result.as_object() {
            for (field, value) in obj {
                by_field.entry(field.clone()).or_default().push(value.clone());
            }
        }
    }
    for (field, values) in by_field {
        outputs.entry(field).or_insert(Value::Array(values));
    }
    outputs
}

/// Convert raw results to a transport-safe form: structured records are
/// flattened, unsupported residues stringified.
fn transport_results(results: &[Value]) -> Vec<Value> {
    results
        .iter()
        .map(|result| match result {
            Value::Object(_) => Value::Object(serialize_properties(result)),
            Value::String(_) | Value::Number(_) | Value::Bool(_) => result.clone(),
            other => Value::String(other.to_string()),
        })
        .collect()
}
