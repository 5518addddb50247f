use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert, ParamSpec};

const HIBP_API: &str = "https://haveibeenpwned.com/api/v3";

/// Checks email addresses against the Have I Been Pwned breach corpus.
/// Requires a vaulted `api_key`.
pub struct BreachLookupTransform;

#[derive(Deserialize)]
struct BreachEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default, rename = "Title")]
    title: Option<String>,
    #[serde(default, rename = "Domain")]
    domain: Option<String>,
    #[serde(default, rename = "BreachDate")]
    breach_date: Option<String>,
    #[serde(default, rename = "PwnCount")]
    pwn_count: Option<u64>,
    #[serde(default, rename = "DataClasses")]
    data_classes: Vec<String>,
}

impl Transform for BreachLookupTransform {
    fn name(&self) -> &str {
        "breach_lookup"
    }

    fn category(&self) -> &str {
        "identity"
    }

    fn key(&self) -> &str {
        "email"
    }

    fn description(&self) -> &str {
        "Check an email address against known data breaches (HIBP)."
    }

    fn icon(&self) -> &str {
        "shield-alert"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "email": { "type": "string" } },
            "required": ["email"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "email": { "type": "string" },
                "breach": { "type": "string" },
                "title": { "type": "string" },
                "domain": { "type": "string" },
                "breach_date": { "type": "string" },
                "pwn_count": { "type": "integer" },
                "data_classes": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("api_key", "Have I Been Pwned API key")
            .required()
            .secret()]
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let api_key = params
                .get("api_key")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .user_agent("Sleuth/0.3")
                .build()
                .map_err(|e| SleuthError::TransformRuntime {
                    transform: "breach_lookup".into(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let mut results = Vec::new();
            for value in values {
                let Some(email) = value.as_str() else {
                    continue;
                };

                let url = format!(
                    "{}/breachedaccount/{}?truncateResponse=false",
                    HIBP_API, email
                );
                let resp = client
                    .get(&url)
                    .header("hibp-api-key", api_key)
                    .send()
                    .await
                    .map_err(|e| SleuthError::TransformRuntime {
                        transform: "breach_lookup".into(),
                        message: format!("HIBP request failed: {}", e),
                    })?;

                match resp.status().as_u16() {
                    // Not found means the account is clean
                    404 => {
                        debug!(email, "No breaches on record");
                        continue;
                    }
                    401 => {
                        return Err(SleuthError::TransformRuntime {
                            transform: "breach_lookup".into(),
                            message: "HIBP rejected the API key".into(),
                        });
                    }
                    code if !(200..300).contains(&code) => {
                        return Err(SleuthError::TransformRuntime {
                            transform: "breach_lookup".into(),
                            message: format!("HIBP returned HTTP {}", code),
                        });
                    }
                    _ => {}
                }

                let entries: Vec<BreachEntry> =
                    resp.json().await.map_err(|e| SleuthError::TransformRuntime {
                        transform: "breach_lookup".into(),
                        message: format!("Malformed HIBP response: {}", e),
                    })?;

                for entry in entries {
                    results.push(json!({
                        "email": email,
                        "breach": entry.name,
                        "title": entry.title,
                        "domain": entry.domain,
                        "breach_date": entry.breach_date,
                        "pwn_count": entry.pwn_count,
                        "data_classes": entry.data_classes,
                    }));
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
                let (Some(email), Some(breach)) = (
                    result.get("email").and_then(Value::as_str),
                    result.get("breach").and_then(Value::as_str),
                ) else {
                    continue;
                };

                let email_fp = fingerprint("Email", email);
                let breach_fp = fingerprint("Breach", breach);

                sink.upsert_node(NodeUpsert {
                    entity_type: "Email".into(),
                    key_prop: "email".into(),
                    key_value: json!(email),
                    fingerprint: email_fp.clone(),
                    properties: json!({}),
                })
                .await?;

                let mut props = Map::new();
                for field in ["title", "domain", "breach_date", "pwn_count", "data_classes"] {
                    if let Some(v) = result.get(field) {
                        props.insert(field.to_string(), v.clone());
                    }
                }
                sink.upsert_node(NodeUpsert {
                    entity_type: "Breach".into(),
                    key_prop: "name".into(),
                    key_value: json!(breach),
                    fingerprint: breach_fp.clone(),
                    properties: Value::Object(props),
                })
                .await?;

                sink.upsert_relationship(EdgeUpsert {
                    from_type: "Email".into(),
                    from_fingerprint: email_fp,
                    to_type: "Breach".into(),
                    to_fingerprint: breach_fp,
                    rel_type: "APPEARED_IN".into(),
                    properties: json!({
                        "breach_date": result.get("breach_date").cloned(),
                    }),
                })
                .await?;
            }
            Ok(results)
        })
    }
}
