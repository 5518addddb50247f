use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use sleuth_core::error::Result;
use sleuth_core::traits::GraphSink;
use sleuth_core::types::{EdgeUpsert, NodeUpsert, SketchId};

use crate::client::{GraphClient, Statement};
use crate::serialize::serialize_properties;

/// Queued, idempotent node/edge upserts against one sketch.
///
/// Operations append to an in-memory queue that auto-flushes once it
/// reaches the configured threshold, or on an explicit `flush`. One flush
/// is one atomic unit of work; if it fails the whole queue is discarded
/// and the failure propagates. Instances are scoped to a single pipeline
/// invocation and never shared across runs.
pub struct GraphWriteBatcher {
    client: Arc<dyn GraphClient>,
    sketch_id: SketchId,
    queue: Vec<Statement>,
    flush_threshold: usize,
}

impl GraphWriteBatcher {
    pub fn new(client: Arc<dyn GraphClient>, sketch_id: SketchId, flush_threshold: usize) -> Self {
        Self {
            client,
            sketch_id,
            queue: Vec::new(),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Number of operations waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue a match-or-create for a node keyed by
    /// `(type, fingerprint, sketch_id)`. The creation timestamp is set
    /// only the first time the key is seen; properties are overwritten on
    /// every call.
    pub async fn upsert_node(&mut self, upsert: NodeUpsert) -> Result<()> {
        let stmt = node_statement(&self.sketch_id, &upsert);
        self.enqueue(stmt).await
    }

    /// Queue a match-or-create for exactly one `rel_type` edge between two
    /// fingerprinted nodes. Repeated calls never create parallel
    /// duplicates.
    pub async fn upsert_relationship(&mut self, upsert: EdgeUpsert) -> Result<()> {
        let stmt = relationship_statement(&self.sketch_id, &upsert);
        self.enqueue(stmt).await
    }

    async fn enqueue(&mut self, stmt: Statement) -> Result<()> {
        self.queue.push(stmt);
        if self.queue.len() >= self.flush_threshold {
            debug!(
                threshold = self.flush_threshold,
                "Write queue reached threshold, flushing"
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// Apply every queued operation as one atomic unit of work. On failure
    /// the queue is discarded, not retried.
    pub async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let statements = std::mem::take(&mut self.queue);
        debug!(
            sketch_id = %self.sketch_id,
            count = statements.len(),
            "Flushing graph writes"
        );
        self.client.execute_batch(statements).await
    }
}

impl GraphSink for GraphWriteBatcher {
    fn upsert_node<'a>(&'a mut self, upsert: NodeUpsert) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert_node(upsert))
    }

    fn upsert_relationship<'a>(&'a mut self, upsert: EdgeUpsert) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert_relationship(upsert))
    }
}

impl Drop for GraphWriteBatcher {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            warn!(
                sketch_id = %self.sketch_id,
                pending = self.queue.len(),
                "Write batcher dropped with unflushed operations"
            );
        }
    }
}

fn node_statement(sketch_id: &SketchId, upsert: &NodeUpsert) -> Statement {
    let label = sanitize_label(&upsert.entity_type, "Entity");
    let mut props = serialize_properties(&upsert.properties);
    props.insert(upsert.key_prop.clone(), upsert.key_value.clone());

    let query = format!(
        "MERGE (n:`{}` {{fingerprint: $fingerprint, sketch_id: $sketch_id}}) \
         ON CREATE SET n.created_at = $created_at \
         SET n += $props",
        label
    );
    Statement::new(
        query,
        serde_json::json!({
            "fingerprint": upsert.fingerprint,
            "sketch_id": sketch_id.0,
            "created_at": Utc::now().to_rfc3339(),
            "props": props,
        }),
    )
}

fn relationship_statement(sketch_id: &SketchId, upsert: &EdgeUpsert) -> Statement {
    let from_label = sanitize_label(&upsert.from_type, "Entity");
    let to_label = sanitize_label(&upsert.to_type, "Entity");
    let rel_type = sanitize_label(&upsert.rel_type, "RELATED_TO");
    let props = serialize_properties(&upsert.properties);

    let query = format!(
        "MATCH (a:`{}` {{fingerprint: $from_fingerprint, sketch_id: $sketch_id}}) \
         MATCH (b:`{}` {{fingerprint: $to_fingerprint, sketch_id: $sketch_id}}) \
         MERGE (a)-[r:`{}`]->(b) \
         SET r += $props",
        from_label, to_label, rel_type
    );
    Statement::new(
        query,
        serde_json::json!({
            "from_fingerprint": upsert.from_fingerprint,
            "to_fingerprint": upsert.to_fingerprint,
            "sketch_id": sketch_id.0,
            "props": props,
        }),
    )
}

/// Labels and relationship types cannot be bound as statement parameters,
/// so they are reduced to `[A-Za-z0-9_]` before splicing into the query.
fn sanitize_label(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        return fallback.to_string();
    }
    if cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("_{}", cleaned)
    } else {
        cleaned
    }
}
