use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::warn;

use sleuth_core::types::RunRecord;
use sleuth_graph::GraphClient;

/// Post-run hook invoked explicitly by the orchestrator after a run
/// reaches a terminal state. Fire-and-forget: hook failures are logged,
/// never propagated into the run result.
pub trait RunHooks: Send + Sync + 'static {
    fn after_run<'a>(&'a self, record: &'a RunRecord) -> BoxFuture<'a, ()>;
}

/// Default hook set: does nothing.
pub struct NoopHooks;

impl RunHooks for NoopHooks {
    fn after_run<'a>(&'a self, _record: &'a RunRecord) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Touches the owning sketch's activity timestamp after every run, so
/// sketch listings can sort by recency without scanning run records.
pub struct SketchActivityHook {
    graph: Arc<dyn GraphClient>,
}

impl SketchActivityHook {
    pub fn new(graph: Arc<dyn GraphClient>) -> Self {
        Self { graph }
    }
}

impl RunHooks for SketchActivityHook {
    fn after_run<'a>(&'a self, record: &'a RunRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self
                .graph
                .execute_write(
                    "MERGE (s:Sketch {sketch_id: $sketch_id}) SET s.last_activity_at = $at",
                    serde_json::json!({
                        "sketch_id": record.sketch_id.0,
                        "at": Utc::now().to_rfc3339(),
                    }),
                )
                .await;

            if let Err(e) = result {
                warn!(
                    sketch_id = %record.sketch_id,
                    error = %e,
                    "Failed to touch sketch activity timestamp"
                );
            }
        })
    }
}
