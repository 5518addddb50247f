use std::collections::HashSet;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::error::Result;
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert};

/// Resolves domain names to their current IP addresses.
pub struct DomainResolveTransform;

impl Transform for DomainResolveTransform {
    fn name(&self) -> &str {
        "domain_resolve"
    }

    fn category(&self) -> &str {
        "infrastructure"
    }

    fn key(&self) -> &str {
        "domain"
    }

    fn description(&self) -> &str {
        "Resolve domain names to IP addresses via system DNS."
    }

    fn icon(&self) -> &str {
        "globe"
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
                "ip": { "type": "string" },
                "version": { "type": "string" }
            }
        })
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        _params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let mut results = Vec::new();
            for value in values {
                let Some(domain) = value.as_str() else {
                    continue;
                };
                let addr = format!("{}:80", domain);
                match tokio::net::lookup_host(addr.as_str()).await {
                    Ok(addrs) => {
                        let mut seen = HashSet::new();
                        for addr in addrs {
                            let ip = addr.ip();
                            if !seen.insert(ip) {
                                continue;
                            }
                            results.push(json!({
                                "domain": domain,
                                "ip": ip.to_string(),
                                "version": if ip.is_ipv4() { "v4" } else { "v6" },
                            }));
                        }
                    }
                    Err(e) => {
                        // NXDOMAIN is a normal investigation outcome
                        debug!(domain, error = %e, "DNS lookup returned nothing");
                    }
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
                let (Some(domain), Some(ip)) = (
                    result.get("domain").and_then(Value::as_str),
                    result.get("ip").and_then(Value::as_str),
                ) else {
                    continue;
                };

                let domain_fp = fingerprint("Domain", domain);
                let ip_fp = fingerprint("IpAddress", ip);

                sink.upsert_node(NodeUpsert {
                    entity_type: "Domain".into(),
                    key_prop: "domain".into(),
                    key_value: json!(domain),
                    fingerprint: domain_fp.clone(),
                    properties: json!({}),
                })
                .await?;

                sink.upsert_node(NodeUpsert {
                    entity_type: "IpAddress".into(),
                    key_prop: "ip".into(),
                    key_value: json!(ip),
                    fingerprint: ip_fp.clone(),
                    properties: json!({
                        "version": result.get("version").cloned(),
                    }),
                })
                .await?;

                sink.upsert_relationship(EdgeUpsert {
                    from_type: "Domain".into(),
                    from_fingerprint: domain_fp,
                    to_type: "IpAddress".into(),
                    to_fingerprint: ip_fp,
                    rel_type: "RESOLVES_TO".into(),
                    properties: json!({ "source": "dns" }),
                })
                .await?;
            }
            Ok(results)
        })
    }
}
