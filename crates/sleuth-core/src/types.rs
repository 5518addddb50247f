use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the investigation-scoped graph container that owns all
/// entities and relationships discovered during runs.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SketchId(pub String);

impl SketchId {
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SketchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the account that owns vaulted secrets.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run. Transitions only move forward:
/// pending -> running -> completed | failed. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// A single enrichment run against one sketch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub sketch_id: SketchId,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

/// Registered transform capability, exposed to discovery UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformDescriptor {
    pub name: String,
    pub category: String,
    /// Canonical property key of the entity the transform consumes.
    pub key: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub params_schema: serde_json::Value,
    pub required_params: Vec<String>,
    pub icon: String,
}

/// Declared transform parameter. `secret` parameters resolve through the
/// vault before falling back to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            secret: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Wire shape of a stored secret. Ciphertext, nonce, and salt never cross
/// the vault boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    pub id: String,
    pub name: String,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
}

/// A node upsert destined for the property graph.
#[derive(Debug, Clone)]
pub struct NodeUpsert {
    /// Entity type, used as the graph label (e.g. "Domain").
    pub entity_type: String,
    /// Display property key for this entity (e.g. "domain").
    pub key_prop: String,
    /// Display property value.
    pub key_value: serde_json::Value,
    /// Deterministic content hash identifying the entity within a sketch.
    pub fingerprint: String,
    /// Additional properties, serialized before write.
    pub properties: serde_json::Value,
}

/// A relationship upsert between two fingerprinted nodes.
#[derive(Debug, Clone)]
pub struct EdgeUpsert {
    pub from_type: String,
    pub from_fingerprint: String,
    pub to_type: String,
    pub to_fingerprint: String,
    /// Relationship type (e.g. "RESOLVES_TO").
    pub rel_type: String,
    pub properties: serde_json::Value,
}

/// Progress event published during a run, tagged with the owning sketch.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run accepted onto the task queue.
    RunQueued { run_id: RunId, sketch_id: SketchId },
    /// Worker picked the run up.
    RunStarted { run_id: RunId, sketch_id: SketchId },
    /// One transform invocation began.
    TransformStarted { sketch_id: SketchId, transform: String },
    /// One transform invocation finished with results.
    TransformCompleted {
        sketch_id: SketchId,
        transform: String,
        result_count: usize,
    },
    /// One transform invocation soft-failed.
    TransformErrored {
        sketch_id: SketchId,
        transform: String,
        error: String,
    },
    /// Run reached the completed state.
    RunCompleted { run_id: RunId, sketch_id: SketchId },
    /// Run reached the failed state.
    RunFailed {
        run_id: RunId,
        sketch_id: SketchId,
        error: String,
    },
}

/// Deterministic content hash used as the idempotence key for a graph
/// entity. Case and surrounding whitespace do not change the identity.
pub fn fingerprint(entity_type: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_bytes());
    hasher.update(b":");
    hasher.update(value.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            let parsed: RunStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("resurrected".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("Domain", "example.com");
        let b = fingerprint("Domain", "example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_normalizes_case_and_whitespace() {
        assert_eq!(
            fingerprint("Domain", "Example.COM  "),
            fingerprint("Domain", "example.com")
        );
    }

    #[test]
    fn fingerprint_separates_types() {
        assert_ne!(
            fingerprint("Domain", "example.com"),
            fingerprint("IpAddress", "example.com")
        );
    }

    #[test]
    fn param_spec_builder() {
        let spec = ParamSpec::new("api_key", "HIBP API key")
            .required()
            .secret();
        assert!(spec.required);
        assert!(spec.secret);
        assert!(spec.default.is_none());
    }
}
