use std::collections::BTreeSet;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::traits::{coerce_raw_values, GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert, ParamSpec};

const CRT_SH: &str = "https://crt.sh";
const DEFAULT_LIMIT: u64 = 100;

/// Enumerates subdomains from certificate-transparency logs (crt.sh).
pub struct SubdomainEnumTransform;

#[derive(Deserialize)]
struct CrtEntry {
    name_value: String,
}

impl Transform for SubdomainEnumTransform {
    fn name(&self) -> &str {
        "subdomain_enum"
    }

    fn category(&self) -> &str {
        "infrastructure"
    }

    fn key(&self) -> &str {
        "domain"
    }

    fn description(&self) -> &str {
        "Enumerate subdomains of a domain from certificate-transparency logs."
    }

    fn icon(&self) -> &str {
        "sitemap"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "domain": { "type": "string" } },
            "required": ["domain"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string" },
                "parent": { "type": "string" }
            }
        })
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("limit", "Maximum subdomains per input domain")
            .with_default(json!(DEFAULT_LIMIT))]
    }

    fn preprocess(&self, raw: &[Value]) -> Result<Vec<Value>> {
        // Keep only plausible domain names, lowercased
        let pattern =
            regex::Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$")
                .unwrap();
        Ok(coerce_raw_values(raw, self.key())
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.trim().to_lowercase()))
            .filter(|s| pattern.is_match(s))
            .map(Value::String)
            .collect())
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let limit = params
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_LIMIT) as usize;

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent("Sleuth/0.3")
                .build()
                .map_err(|e| SleuthError::TransformRuntime {
                    transform: "subdomain_enum".into(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let mut results = Vec::new();
            for value in values {
                let Some(domain) = value.as_str() else {
                    continue;
                };

                let url = format!("{}/?q=%.{}&output=json", CRT_SH, domain);
                let resp = client.get(&url).send().await.map_err(|e| {
                    SleuthError::TransformRuntime {
                        transform: "subdomain_enum".into(),
                        message: format!("crt.sh request failed: {}", e),
                    }
                })?;

                if !resp.status().is_success() {
                    debug!(domain, status = resp.status().as_u16(), "crt.sh returned non-success");
                    continue;
                }

                let entries: Vec<CrtEntry> = resp.json().await.unwrap_or_default();
                for name in extract_subdomains(&entries, domain, limit) {
                    results.push(json!({ "domain": name, "parent": domain }));
                }
            }
            Ok(results)
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
                let (Some(sub), Some(parent)) = (
                    result.get("domain").and_then(Value::as_str),
                    result.get("parent").and_then(Value::as_str),
                ) else {
                    continue;
                };

                let sub_fp = fingerprint("Domain", sub);
                let parent_fp = fingerprint("Domain", parent);

                sink.upsert_node(NodeUpsert {
                    entity_type: "Domain".into(),
                    key_prop: "domain".into(),
                    key_value: json!(parent),
                    fingerprint: parent_fp.clone(),
                    properties: json!({}),
                })
                .await?;

                sink.upsert_node(NodeUpsert {
                    entity_type: "Domain".into(),
                    key_prop: "domain".into(),
                    key_value: json!(sub),
                    fingerprint: sub_fp.clone(),
                    properties: json!({ "source": "crt.sh" }),
                })
                .await?;

                sink.upsert_relationship(EdgeUpsert {
                    from_type: "Domain".into(),
                    from_fingerprint: sub_fp,
                    to_type: "Domain".into(),
                    to_fingerprint: parent_fp,
                    rel_type: "SUBDOMAIN_OF".into(),
                    properties: json!({}),
                })
                .await?;
            }
            Ok(results)
        })
    }
}

/// Pull distinct subdomains of `parent` out of crt.sh entries. Wildcard
/// prefixes are stripped; the parent itself is excluded.
fn extract_subdomains(entries: &[CrtEntry], parent: &str, limit: usize) -> Vec<String> {
    let suffix = format!(".{}", parent);
    let mut names = BTreeSet::new();

    for entry in entries {
        for line in entry.name_value.lines() {
            let name = line.trim().trim_start_matches("*.").to_lowercase();
            if name.ends_with(&suffix) {
                names.insert(name);
            }
        }
    }

    names.into_iter().take(limit).collect()
}
