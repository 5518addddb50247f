use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use sleuth_core::config::VaultConfig;
use sleuth_core::error::Result;
use sleuth_core::event::EventBus;
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, NodeUpsert, OwnerId, ParamSpec, RunId, RunStatus, SketchId};
use sleuth_engine::{compile, RunOrchestrator, RunPayload, RunStore, TaskQueue};
use sleuth_graph::MemoryGraphClient;
use sleuth_transforms::TransformRegistry;
use sleuth_vault::SecretVault;
use tokio_util::sync::CancellationToken;

/// Minimal enrichment stand-in: tags every input and writes one node
/// per result. Declares a required vaulted key so the full secret
/// binding path is exercised end to end.
struct TagTransform;

impl Transform for TagTransform {
    fn name(&self) -> &str {
        "tag"
    }
    fn category(&self) -> &str {
        "test"
    }
    fn key(&self) -> &str {
        "value"
    }
    fn description(&self) -> &str {
        "Tags inputs."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "string"})
    }
    fn output_schema(&self) -> Value {
        json!({"properties": {"value": {"type": "string"}}})
    }
    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("api_key", "upstream key").required().secret()]
    }
    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            assert_eq!(params["api_key"], json!("k-from-vault"));
            Ok(values
                .iter()
                .filter_map(Value::as_str)
                .map(|v| json!({"value": format!("tagged:{}", v)}))
                .collect())
        })
    }
    fn postprocess<'a>(
        &'a self,
        results: Vec<Value>,
        _values: &'a [Value],
        sink: &'a mut dyn GraphSink,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            for result in &results {
                if let Some(value) = result.get("value").and_then(Value::as_str) {
                    sink.upsert_node(NodeUpsert {
                        entity_type: "Tag".into(),
                        key_prop: "value".into(),
                        key_value: json!(value),
                        fingerprint: fingerprint("Tag", value),
                        properties: json!({}),
                    })
                    .await?;
                }
            }
            Ok(results)
        })
    }
}

fn vault_config() -> VaultConfig {
    VaultConfig {
        master_key: Some(base64::engine::general_purpose::STANDARD.encode([11u8; 32])),
        key_version: "V1".into(),
    }
}

async fn wait_terminal(queue: &TaskQueue, run_id: &RunId) {
    for _ in 0..300 {
        if let Some(status) = queue.status(run_id).await {
            if status.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never finished");
}

#[tokio::test]
async fn flow_run_end_to_end_with_vaulted_secret() {
    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("sleuth.db");
    let owner = OwnerId::from_string("analyst");

    // Seed the vault the way the CLI would
    {
        let vault = SecretVault::open(&vault_config(), &vault_path).unwrap();
        vault.set_secret(&owner, "api_key", "k-from-vault").unwrap();
    }

    let mut registry = TransformRegistry::new();
    registry.register(TagTransform);

    let graph = Arc::new(MemoryGraphClient::new());
    let runs = Arc::new(RunStore::in_memory().unwrap());
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::new(registry),
        graph.clone(),
        runs.clone(),
        Arc::new(EventBus::default()),
        vault_config(),
        vault_path,
        100,
    ));

    let cancel = CancellationToken::new();
    let queue = TaskQueue::start(orchestrator, 1, cancel.clone());

    // seed -> tag, compiled through the real compiler
    let nodes: Vec<sleuth_core::flow::FlowNode> = serde_json::from_value(json!([
        {"id": "seed-1", "type": "seed"},
        {"id": "tag-1", "type": "transform", "params": {"transform": "tag"}}
    ]))
    .unwrap();
    let edges: Vec<sleuth_core::flow::FlowEdge> = serde_json::from_value(json!([
        {"id": "e1", "source": "seed-1", "target": "tag-1"}
    ]))
    .unwrap();
    let branches = compile(&nodes, &edges, "example.com");

    let run_id = queue
        .submit(
            SketchId::from_string("case-7"),
            Some(owner),
            RunPayload::Branches(branches),
            vec!["example.com".into()],
            Map::new(),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    wait_terminal(&queue, &run_id).await;

    let record = runs.get(&run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.error.is_none());

    let results = record.results.unwrap();
    let steps = results["branches"][0]["steps"].as_array().unwrap();
    assert_eq!(steps[1]["status"], json!("completed"));
    assert_eq!(steps[1]["results"][0]["value"], json!("tagged:example.com"));

    // Discovered entity landed in the sketch-scoped graph
    let tag = graph
        .get_node("Tag", &fingerprint("Tag", "tagged:example.com"), "case-7")
        .unwrap();
    assert_eq!(tag.properties["value"], json!("tagged:example.com"));

    cancel.cancel();
    queue.shutdown().await;
}

#[tokio::test]
async fn run_without_secret_fails_at_validation() {
    let dir = tempfile::tempdir().unwrap();

    let mut registry = TransformRegistry::new();
    registry.register(TagTransform);

    let runs = Arc::new(RunStore::in_memory().unwrap());
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::new(registry),
        Arc::new(MemoryGraphClient::new()),
        runs.clone(),
        Arc::new(EventBus::default()),
        vault_config(),
        dir.path().join("sleuth.db"),
        100,
    ));

    let cancel = CancellationToken::new();
    let queue = TaskQueue::start(orchestrator, 1, cancel.clone());

    let run_id = queue
        .submit(
            SketchId::from_string("case-7"),
            Some(OwnerId::from_string("analyst-without-secrets")),
            RunPayload::Transform { name: "tag".into() },
            vec!["example.com".into()],
            Map::new(),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    wait_terminal(&queue, &run_id).await;

    let record = runs.get(&run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.error.unwrap().contains("api_key"));

    cancel.cancel();
    queue.shutdown().await;
}
