use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::event::EventBus;
use sleuth_core::traits::Transform;
use sleuth_core::types::{OwnerId, RunEvent, SketchId};
use sleuth_graph::{GraphClient, GraphWriteBatcher};
use sleuth_vault::SecretVault;

use crate::params;

/// Tagged result of one transform invocation. A soft failure carries the
/// reason and an empty result list; the caller decides whether the
/// containing run continues.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Vec<Value>),
    Failed { reason: String },
}

impl StepOutcome {
    pub fn results(self) -> Vec<Value> {
        match self {
            Self::Completed(results) => results,
            Self::Failed { .. } => Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// One transform invocation request.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Raw input values, heterogeneous shapes allowed.
    pub raw_values: Vec<Value>,
    /// Caller-supplied parameter values.
    pub params: Map<String, Value>,
    /// Caller-supplied secret references, keyed by parameter name.
    pub secret_refs: BTreeMap<String, String>,
    pub sketch_id: SketchId,
    /// Owner whose vault resolves secret parameters.
    pub owner: Option<OwnerId>,
}

impl Invocation {
    pub fn new(raw_values: Vec<Value>, sketch_id: SketchId) -> Self {
        Self {
            raw_values,
            params: Map::new(),
            secret_refs: BTreeMap::new(),
            sketch_id,
            owner: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_secret_ref(mut self, param: impl Into<String>, reference: impl Into<String>) -> Self {
        self.secret_refs.insert(param.into(), reference.into());
        self
    }
}

/// Fixed-stage execution contract every transform invocation follows:
/// configuration resolution, strict validation, preprocess, scan,
/// postprocess, flush.
///
/// Resolution and validation failures abort the invocation before `scan`
/// ever runs and propagate to the caller. Errors inside the
/// preprocess/scan/postprocess body are soft: they are logged, emitted as
/// an `errored` progress event, and surface as `StepOutcome::Failed` so a
/// single failing transform never aborts a containing multi-branch run.
/// Graph-store failures are the exception: a broken flush propagates.
pub struct TransformPipeline {
    graph: Arc<dyn GraphClient>,
    vault: Option<Arc<SecretVault>>,
    events: Arc<EventBus>,
    flush_threshold: usize,
}

impl TransformPipeline {
    pub fn new(
        graph: Arc<dyn GraphClient>,
        vault: Option<Arc<SecretVault>>,
        events: Arc<EventBus>,
        flush_threshold: usize,
    ) -> Self {
        Self {
            graph,
            vault,
            events,
            flush_threshold,
        }
    }

    /// Run one transform invocation through the full stage contract.
    pub async fn execute(
        &self,
        transform: &dyn Transform,
        invocation: Invocation,
    ) -> Result<StepOutcome> {
        let name = transform.name().to_string();
        let specs = transform.param_specs();

        // Stage 1: configuration resolution
        let resolved = params::resolve(
            &name,
            &specs,
            &invocation.params,
            &invocation.secret_refs,
            self.vault.as_deref(),
            invocation.owner.as_ref(),
        )?;

        // Stage 2: strict validation, aborts this instance on failure
        params::validate(&name, &specs, &resolved)?;

        self.events.publish(RunEvent::TransformStarted {
            sketch_id: invocation.sketch_id.clone(),
            transform: name.clone(),
        });
        debug!(transform = %name, sketch_id = %invocation.sketch_id, "Transform started");

        // Stages 3-5 run against an invocation-scoped write batcher
        let mut batcher = GraphWriteBatcher::new(
            self.graph.clone(),
            invocation.sketch_id.clone(),
            self.flush_threshold,
        );

        let body = async {
            let normalized = transform.preprocess(&invocation.raw_values)?;
            let results = transform.scan(&normalized, &resolved).await?;
            transform
                .postprocess(results, &normalized, &mut batcher)
                .await
        };
        let outcome = body.await;

        match outcome {
            Ok(results) => {
                // Stage 6: flush pending writes; store failures propagate
                batcher.flush().await?;
                self.events.publish(RunEvent::TransformCompleted {
                    sketch_id: invocation.sketch_id.clone(),
                    transform: name.clone(),
                    result_count: results.len(),
                });
                debug!(transform = %name, results = results.len(), "Transform completed");
                Ok(StepOutcome::Completed(results))
            }
            Err(err @ SleuthError::GraphStore(_)) => Err(err),
            Err(err) => {
                warn!(
                    transform = %name,
                    sketch_id = %invocation.sketch_id,
                    error = %err,
                    "Transform soft-failed"
                );
                self.events.publish(RunEvent::TransformErrored {
                    sketch_id: invocation.sketch_id.clone(),
                    transform: name.clone(),
                    error: err.to_string(),
                });
                Ok(StepOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use sleuth_core::traits::GraphSink;
    use sleuth_core::types::{fingerprint, NodeUpsert, ParamSpec};
    use sleuth_graph::MemoryGraphClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTransform {
        scan_calls: AtomicUsize,
    }

    impl EchoTransform {
        fn new() -> Self {
            Self {
                scan_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Transform for EchoTransform {
        fn name(&self) -> &str {
            "echo"
        }
        fn category(&self) -> &str {
            "test"
        }
        fn key(&self) -> &str {
            "value"
        }
        fn description(&self) -> &str {
            "Echoes its inputs."
        }
        fn input_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn output_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn scan<'a>(
            &'a self,
            values: &'a [Value],
            _params: &'a Map<String, Value>,
        ) -> BoxFuture<'a, Result<Vec<Value>>> {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(values.to_vec()) })
        }
        fn postprocess<'a>(
            &'a self,
            results: Vec<Value>,
            _values: &'a [Value],
            sink: &'a mut dyn GraphSink,
        ) -> BoxFuture<'a, Result<Vec<Value>>> {
            Box::pin(async move {
                for result in &results {
                    if let Some(value) = result.as_str() {
                        sink.upsert_node(NodeUpsert {
                            entity_type: "Echo".into(),
                            key_prop: "value".into(),
                            key_value: json!(value),
                            fingerprint: fingerprint("Echo", value),
                            properties: json!({}),
                        })
                        .await?;
                    }
                }
                Ok(results)
            })
        }
    }

    struct SecretiveTransform {
        scan_calls: AtomicUsize,
    }

    impl Transform for SecretiveTransform {
        fn name(&self) -> &str {
            "secretive"
        }
        fn category(&self) -> &str {
            "test"
        }
        fn key(&self) -> &str {
            "value"
        }
        fn description(&self) -> &str {
            "Needs a vaulted key."
        }
        fn input_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn output_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn param_specs(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::new("api_key", "service key").required().secret()]
        }
        fn scan<'a>(
            &'a self,
            _values: &'a [Value],
            _params: &'a Map<String, Value>,
        ) -> BoxFuture<'a, Result<Vec<Value>>> {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(Vec::new()) })
        }
    }

    struct BrokenScanTransform;

    impl Transform for BrokenScanTransform {
        fn name(&self) -> &str {
            "broken"
        }
        fn category(&self) -> &str {
            "test"
        }
        fn key(&self) -> &str {
            "value"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn input_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn output_schema(&self) -> Value {
            json!({"type": "string"})
        }
        fn scan<'a>(
            &'a self,
            _values: &'a [Value],
            _params: &'a Map<String, Value>,
        ) -> BoxFuture<'a, Result<Vec<Value>>> {
            Box::pin(async move {
                Err(SleuthError::TransformRuntime {
                    transform: "broken".into(),
                    message: "upstream returned garbage".into(),
                })
            })
        }
    }

    fn pipeline() -> (TransformPipeline, Arc<MemoryGraphClient>, Arc<EventBus>) {
        let graph = Arc::new(MemoryGraphClient::new());
        let events = Arc::new(EventBus::default());
        let pipeline = TransformPipeline::new(graph.clone(), None, events.clone(), 100);
        (pipeline, graph, events)
    }

    #[tokio::test]
    async fn completed_invocation_flushes_writes() {
        let (pipeline, graph, _events) = pipeline();
        let transform = EchoTransform::new();

        let outcome = pipeline
            .execute(
                &transform,
                Invocation::new(vec![json!("hello")], SketchId::from_string("sk1")),
            )
            .await
            .unwrap();

        assert!(!outcome.is_failed());
        assert_eq!(outcome.results(), vec![json!("hello")]);
        assert_eq!(graph.node_count(), 1);
    }

    #[tokio::test]
    async fn scan_error_soft_fails_and_emits_event() {
        let (pipeline, graph, events) = pipeline();
        let mut rx = events.subscribe();

        let outcome = pipeline
            .execute(
                &BrokenScanTransform,
                Invocation::new(vec![json!("x")], SketchId::from_string("sk1")),
            )
            .await
            .unwrap();

        assert!(outcome.is_failed());
        assert!(outcome.results().is_empty());
        assert_eq!(graph.node_count(), 0);

        // started, then errored
        assert!(matches!(
            rx.try_recv().unwrap(),
            RunEvent::TransformStarted { .. }
        ));
        match rx.try_recv().unwrap() {
            RunEvent::TransformErrored { transform, .. } => assert_eq!(transform, "broken"),
            other => panic!("expected errored event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_required_secret_aborts_before_scan() {
        let (pipeline, _graph, _events) = pipeline();
        let transform = SecretiveTransform {
            scan_calls: AtomicUsize::new(0),
        };

        let err = pipeline
            .execute(
                &transform,
                Invocation::new(vec![json!("x")], SketchId::from_string("sk1")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SleuthError::Validation { .. }));
        assert_eq!(transform.scan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vaulted_secret_reaches_validation() {
        use base64::Engine;
        let graph = Arc::new(MemoryGraphClient::new());
        let events = Arc::new(EventBus::default());
        let vault = Arc::new(
            SecretVault::in_memory(&sleuth_core::config::VaultConfig {
                master_key: Some(base64::engine::general_purpose::STANDARD.encode([2u8; 32])),
                key_version: "V1".into(),
            })
            .unwrap(),
        );
        let owner = OwnerId::from_string("alice");
        vault.set_secret(&owner, "api_key", "k-42").unwrap();

        let pipeline = TransformPipeline::new(graph, Some(vault), events, 100);
        let transform = SecretiveTransform {
            scan_calls: AtomicUsize::new(0),
        };

        let outcome = pipeline
            .execute(
                &transform,
                Invocation::new(vec![json!("x")], SketchId::from_string("sk1"))
                    .with_owner(owner),
            )
            .await
            .unwrap();

        assert!(!outcome.is_failed());
        assert_eq!(transform.scan_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_caller_param_is_rejected() {
        let (pipeline, _graph, _events) = pipeline();
        let transform = EchoTransform::new();

        let mut params = Map::new();
        params.insert("mystery".into(), json!(true));

        let err = pipeline
            .execute(
                &transform,
                Invocation::new(vec![json!("x")], SketchId::from_string("sk1"))
                    .with_params(params),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SleuthError::Validation { .. }));
        assert_eq!(transform.scan_calls.load(Ordering::SeqCst), 0);
    }
}
