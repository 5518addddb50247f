use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{EdgeUpsert, NodeUpsert, ParamSpec, TransformDescriptor};

/// Sink for graph writes issued from a transform's postprocess stage.
/// Implementations batch and flush against the property graph store.
pub trait GraphSink: Send {
    /// Queue an idempotent node upsert.
    fn upsert_node<'a>(&'a mut self, upsert: NodeUpsert) -> BoxFuture<'a, Result<()>>;

    /// Queue an idempotent relationship upsert between two known nodes.
    fn upsert_relationship<'a>(&'a mut self, upsert: EdgeUpsert) -> BoxFuture<'a, Result<()>>;
}

/// Transform: a self-contained enrichment unit.
///
/// Implementations provide the descriptor surface plus the three
/// pipeline-owned stages: `preprocess` normalizes heterogeneous raw
/// inputs, `scan` performs the actual lookup (may do network I/O), and
/// `postprocess` converts results into graph writes. The pipeline calls
/// the stages in order; implementations never call each other.
pub trait Transform: Send + Sync + 'static {
    /// Registry name (e.g. "domain_resolve").
    fn name(&self) -> &str;

    /// Discovery category (e.g. "infrastructure").
    fn category(&self) -> &str;

    /// Canonical property key of the entity this transform consumes
    /// (e.g. "domain").
    fn key(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Icon hint for discovery UIs.
    fn icon(&self) -> &str {
        "search"
    }

    /// JSON Schema for accepted input values.
    fn input_schema(&self) -> serde_json::Value;

    /// JSON Schema for produced output records.
    fn output_schema(&self) -> serde_json::Value;

    /// Declared parameters.
    fn param_specs(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Normalize raw seed values into the shape `scan` expects. Inputs
    /// may be plain strings, structured records, or already-typed values.
    fn preprocess(&self, raw: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        Ok(coerce_raw_values(raw, self.key()))
    }

    /// Perform the lookup. Errors raised here are caught at the pipeline
    /// boundary and soft-failed.
    fn scan<'a>(
        &'a self,
        values: &'a [serde_json::Value],
        params: &'a serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>>;

    /// Convert scan results into graph upserts. The default passes
    /// results through untouched.
    fn postprocess<'a>(
        &'a self,
        results: Vec<serde_json::Value>,
        values: &'a [serde_json::Value],
        sink: &'a mut dyn GraphSink,
    ) -> BoxFuture<'a, Result<Vec<serde_json::Value>>> {
        let _ = (values, sink);
        Box::pin(async move { Ok(results) })
    }

    /// Descriptor for discovery listings.
    fn descriptor(&self) -> TransformDescriptor {
        let specs = self.param_specs();
        let mut properties = serde_json::Map::new();
        for spec in &specs {
            properties.insert(
                spec.name.clone(),
                serde_json::json!({
                    "type": "string",
                    "description": spec.description,
                    "secret": spec.secret,
                }),
            );
        }
        TransformDescriptor {
            name: self.name().to_string(),
            category: self.category().to_string(),
            key: self.key().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            output_schema: self.output_schema(),
            params_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "additionalProperties": false,
            }),
            required_params: specs
                .iter()
                .filter(|s| s.required)
                .map(|s| s.name.clone())
                .collect(),
            icon: self.icon().to_string(),
        }
    }
}

/// Coerce heterogeneous raw inputs into flat scalar values.
///
/// Strings and numbers pass through; arrays flatten one level; objects
/// yield their `key` field, falling back to `value`. Anything else is
/// dropped.
pub fn coerce_raw_values(raw: &[serde_json::Value], key: &str) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for value in raw {
        match value {
            serde_json::Value::String(_) | serde_json::Value::Number(_) => {
                out.push(value.clone());
            }
            serde_json::Value::Array(items) => {
                out.extend(coerce_raw_values(items, key));
            }
            serde_json::Value::Object(map) => {
                if let Some(inner) = map.get(key).or_else(|| map.get("value")) {
                    out.extend(coerce_raw_values(std::slice::from_ref(inner), key));
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_passes_strings_through() {
        let raw = vec![json!("example.com"), json!("example.org")];
        assert_eq!(coerce_raw_values(&raw, "domain"), raw);
    }

    #[test]
    fn coerce_flattens_arrays() {
        let raw = vec![json!(["a.com", ["b.com"]])];
        assert_eq!(
            coerce_raw_values(&raw, "domain"),
            vec![json!("a.com"), json!("b.com")]
        );
    }

    #[test]
    fn coerce_extracts_keyed_field() {
        let raw = vec![json!({"domain": "a.com", "other": 1})];
        assert_eq!(coerce_raw_values(&raw, "domain"), vec![json!("a.com")]);
    }

    #[test]
    fn coerce_falls_back_to_value_field() {
        let raw = vec![json!({"value": "a.com"})];
        assert_eq!(coerce_raw_values(&raw, "domain"), vec![json!("a.com")]);
    }

    #[test]
    fn coerce_drops_unusable_values() {
        let raw = vec![json!(null), json!(true), json!({"unrelated": 1})];
        assert!(coerce_raw_values(&raw, "domain").is_empty());
    }
}
