use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};

/// One parameterized statement against the graph store.
#[derive(Debug, Clone, Serialize)]
pub struct Statement {
    #[serde(rename = "statement")]
    pub query: String,
    pub parameters: serde_json::Value,
}

impl Statement {
    pub fn new(query: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            query: query.into(),
            parameters,
        }
    }
}

/// Client surface the write batcher requires from the property graph
/// store. `execute_batch` applies all statements as one atomic unit of
/// work.
pub trait GraphClient: Send + Sync + 'static {
    /// Run a read query, returning raw result rows.
    fn query<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>>;

    /// Run a single write statement, returning raw result rows.
    fn execute_write<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>>;

    /// Apply a batch of write statements in one transaction.
    fn execute_batch<'a>(&'a self, statements: Vec<Statement>) -> BoxFuture<'a, Result<()>>;
}

// ── HTTP transaction API client ─────────────────────────────────

/// Graph client speaking the Neo4j HTTP transaction API. Every call is
/// one `tx/commit` POST, so a batch either commits whole or not at all.
pub struct HttpGraphClient {
    http: reqwest::Client,
    endpoint: String,
    user: String,
    password: Option<String>,
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxRow {
    #[serde(default)]
    row: serde_json::Value,
}

#[derive(Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl HttpGraphClient {
    pub fn new(config: &sleuth_core::config::GraphConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("Sleuth/0.3")
            .build()
            .map_err(|e| SleuthError::GraphStore(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/db/{}/tx/commit",
                config.uri.trim_end_matches('/'),
                config.database
            ),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn commit(&self, statements: Vec<Statement>) -> Result<Vec<serde_json::Value>> {
        let body = serde_json::json!({ "statements": statements });

        let resp = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, self.password.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|e| SleuthError::GraphStore(format!("Request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SleuthError::GraphStore(format!(
                "Graph store returned HTTP {}",
                status.as_u16()
            )));
        }

        let parsed: TxResponse = resp
            .json()
            .await
            .map_err(|e| SleuthError::GraphStore(format!("Malformed response: {}", e)))?;

        if let Some(err) = parsed.errors.first() {
            return Err(SleuthError::GraphStore(format!(
                "{}: {}",
                err.code, err.message
            )));
        }

        let rows = parsed
            .results
            .into_iter()
            .flat_map(|r| r.data.into_iter().map(|d| d.row))
            .collect();
        Ok(rows)
    }
}

impl GraphClient for HttpGraphClient {
    fn query<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>> {
        Box::pin(async move {
            self.commit(vec![Statement::new(query, parameters)]).await
        })
    }

    fn execute_write<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>> {
        Box::pin(async move {
            self.commit(vec![Statement::new(query, parameters)]).await
        })
    }

    fn execute_batch<'a>(&'a self, statements: Vec<Statement>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!(count = statements.len(), "Committing graph write batch");
            self.commit(statements).await?;
            Ok(())
        })
    }
}

// ── In-process graph double ─────────────────────────────────────

/// A stored node inside the in-process graph.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub created_at: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
struct MemoryState {
    /// Keyed by (label, fingerprint, sketch_id).
    nodes: HashMap<(String, String, String), MemoryNode>,
    /// Keyed by (from_fingerprint, to_fingerprint, rel_type, sketch_id).
    rels: HashMap<(String, String, String, String), serde_json::Map<String, serde_json::Value>>,
    /// Every statement applied, in order.
    log: Vec<Statement>,
}

/// In-process graph store honoring the merge semantics of the statements
/// the write batcher emits. Used by tests and offline previews; it
/// recognizes the batcher's node-merge and relationship-merge shapes and
/// records everything else in the statement log.
#[derive(Default)]
pub struct MemoryGraphClient {
    state: Mutex<MemoryState>,
}

impl MemoryGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().expect("graph state lock").nodes.len()
    }

    pub fn rel_count(&self) -> usize {
        self.state.lock().expect("graph state lock").rels.len()
    }

    pub fn statement_count(&self) -> usize {
        self.state.lock().expect("graph state lock").log.len()
    }

    pub fn get_node(&self, label: &str, fingerprint: &str, sketch_id: &str) -> Option<MemoryNode> {
        self.state
            .lock()
            .expect("graph state lock")
            .nodes
            .get(&(label.to_string(), fingerprint.to_string(), sketch_id.to_string()))
            .cloned()
    }

    pub fn get_rel(
        &self,
        from_fingerprint: &str,
        to_fingerprint: &str,
        rel_type: &str,
        sketch_id: &str,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.state
            .lock()
            .expect("graph state lock")
            .rels
            .get(&(
                from_fingerprint.to_string(),
                to_fingerprint.to_string(),
                rel_type.to_string(),
                sketch_id.to_string(),
            ))
            .cloned()
    }

    fn apply(state: &mut MemoryState, stmt: &Statement) {
        let params = stmt.parameters.as_object().cloned().unwrap_or_default();
        let str_param = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let props = params
            .get("props")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        if stmt.query.starts_with("MERGE (n:") {
            let label = extract_backticked(&stmt.query).unwrap_or_default();
            let key = (label, str_param("fingerprint"), str_param("sketch_id"));
            let entry = state.nodes.entry(key).or_insert_with(|| MemoryNode {
                created_at: str_param("created_at"),
                properties: serde_json::Map::new(),
            });
            // Every call overwrites properties; created_at stays first-write
            entry.properties = props;
        } else if stmt.query.starts_with("MATCH (a:") {
            let sketch = str_param("sketch_id");
            let rel = stmt
                .query
                .split("-[r:`")
                .nth(1)
                .and_then(|rest| rest.split('`').next())
                .unwrap_or_default()
                .to_string();
            let key = (
                str_param("from_fingerprint"),
                str_param("to_fingerprint"),
                rel,
                sketch,
            );
            let entry = state.rels.entry(key).or_default();
            *entry = props;
        }
    }
}

fn extract_backticked(query: &str) -> Option<String> {
    let start = query.find('`')? + 1;
    let rest = &query[start..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

impl GraphClient for MemoryGraphClient {
    fn query<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("graph state lock");
            state.log.push(Statement::new(query, parameters));
            Ok(Vec::new())
        })
    }

    fn execute_write<'a>(
        &'a self,
        query: &'a str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("graph state lock");
            let stmt = Statement::new(query, parameters);
            Self::apply(&mut state, &stmt);
            state.log.push(stmt);
            Ok(Vec::new())
        })
    }

    fn execute_batch<'a>(&'a self, statements: Vec<Statement>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("graph state lock");
            for stmt in statements {
                Self::apply(&mut state, &stmt);
                state.log.push(stmt);
            }
            Ok(())
        })
    }
}
