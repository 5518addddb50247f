use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use sleuth_core::error::Result;
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert, ParamSpec};

const DEFAULT_SERVER: &str = "whois.verisign-grs.com";

/// Fetches registration details for a domain over the WHOIS protocol
/// (RFC 3912, plain TCP on port 43).
pub struct WhoisLookupTransform;

impl Transform for WhoisLookupTransform {
    fn name(&self) -> &str {
        "whois_lookup"
    }

    fn category(&self) -> &str {
        "registration"
    }

    fn key(&self) -> &str {
        "domain"
    }

    fn description(&self) -> &str {
        "Look up registrar, registration dates, and name servers for a domain."
    }

    fn icon(&self) -> &str {
        "file-text"
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
                "registrar": { "type": "string" },
                "created": { "type": "string" },
                "expires": { "type": "string" },
                "name_servers": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("server", "WHOIS server to query")
            .with_default(json!(DEFAULT_SERVER))]
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let server = params
                .get("server")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_SERVER);

            let mut results = Vec::new();
            for value in values {
                let Some(domain) = value.as_str() else {
                    continue;
                };
                match query_whois(server, domain).await {
                    Ok(raw) => {
                        let mut record = parse_whois(&raw);
                        record.insert("domain".to_string(), json!(domain));
                        results.push(Value::Object(record));
                    }
                    Err(e) => {
                        debug!(domain, server, error = %e, "WHOIS query failed");
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
                let Some(domain) = result.get("domain").and_then(Value::as_str) else {
                    continue;
                };
                let domain_fp = fingerprint("Domain", domain);

                let mut props = Map::new();
                for field in ["registrar", "created", "expires", "name_servers"] {
                    if let Some(v) = result.get(field) {
                        props.insert(field.to_string(), v.clone());
                    }
                }

                sink.upsert_node(NodeUpsert {
                    entity_type: "Domain".into(),
                    key_prop: "domain".into(),
                    key_value: json!(domain),
                    fingerprint: domain_fp.clone(),
                    properties: Value::Object(props),
                })
                .await?;

                if let Some(registrar) = result.get("registrar").and_then(Value::as_str) {
                    let org_fp = fingerprint("Organization", registrar);
                    sink.upsert_node(NodeUpsert {
                        entity_type: "Organization".into(),
                        key_prop: "name".into(),
                        key_value: json!(registrar),
                        fingerprint: org_fp.clone(),
                        properties: json!({ "role": "registrar" }),
                    })
                    .await?;

                    sink.upsert_relationship(EdgeUpsert {
                        from_type: "Domain".into(),
                        from_fingerprint: domain_fp,
                        to_type: "Organization".into(),
                        to_fingerprint: org_fp,
                        rel_type: "REGISTERED_BY".into(),
                        properties: json!({}),
                    })
                    .await?;
                }
            }
            Ok(results)
        })
    }
}

/// Send one WHOIS query and read the full response.
async fn query_whois(server: &str, domain: &str) -> Result<String> {
    let mut stream = tokio::net::TcpStream::connect((server, 43)).await?;
    stream.write_all(format!("{}\r\n", domain).as_bytes()).await?;
    stream.shutdown().await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Extract the fields worth keeping out of a raw WHOIS response.
fn parse_whois(raw: &str) -> Map<String, Value> {
    let mut record = Map::new();
    let mut name_servers = Vec::new();

    for line in raw.lines() {
        // Referral terminator used by thin registries
        if line.starts_with(">>>") {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "registrar" => {
                record.entry("registrar".to_string()).or_insert(json!(value));
            }
            "creation date" | "created" => {
                record.entry("created".to_string()).or_insert(json!(value));
            }
            "registry expiry date" | "expiry date" | "expires" => {
                record.entry("expires".to_string()).or_insert(json!(value));
            }
            "name server" | "nserver" => {
                let ns = value.to_lowercase();
                if !name_servers.contains(&ns) {
                    name_servers.push(ns);
                }
            }
            _ => {}
        }
    }

    if !name_servers.is_empty() {
        record.insert("name_servers".to_string(), json!(name_servers));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use sleuth_core::types::SketchId;
    use sleuth_graph::{GraphWriteBatcher, MemoryGraphClient};
    use std::sync::Arc;

    const SAMPLE: &str = "\
   Domain Name: EXAMPLE.COM\r
   Registrar: Example Registrar, Inc.\r
   Creation Date: 1995-08-14T04:00:00Z\r
   Registry Expiry Date: 2026-08-13T04:00:00Z\r
   Name Server: A.IANA-SERVERS.NET\r
   Name Server: B.IANA-SERVERS.NET\r
   Name Server: a.iana-servers.net\r
>>> Last update of whois database: 2026-01-01T00:00:00Z <<<\r
   Registrar: After Terminator Should Be Ignored\r
";

    #[test]
    fn parse_extracts_key_fields() {
        let record = parse_whois(SAMPLE);
        assert_eq!(record["registrar"], json!("Example Registrar, Inc."));
        assert_eq!(record["created"], json!("1995-08-14T04:00:00Z"));
        assert_eq!(record["expires"], json!("2026-08-13T04:00:00Z"));
        assert_eq!(
            record["name_servers"],
            json!(["a.iana-servers.net", "b.iana-servers.net"])
        );
    }

    #[test]
    fn parse_keeps_first_occurrence() {
        let raw = "Registrar: First\nRegistrar: Second\n";
        let record = parse_whois(raw);
        assert_eq!(record["registrar"], json!("First"));
    }

    #[test]
    fn parse_tolerates_garbage() {
        let record = parse_whois("no fields here\njust noise\n");
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn postprocess_writes_domain_props_and_registrar() {
        let client = Arc::new(MemoryGraphClient::new());
        let mut batcher =
            GraphWriteBatcher::new(client.clone(), SketchId::from_string("sk1"), 100);

        let mut record = parse_whois(SAMPLE);
        record.insert("domain".to_string(), json!("example.com"));

        let transform = WhoisLookupTransform;
        transform
            .postprocess(vec![Value::Object(record)], &[], &mut batcher)
            .await
            .unwrap();
        batcher.flush().await.unwrap();

        let domain = client
            .get_node("Domain", &fingerprint("Domain", "example.com"), "sk1")
            .unwrap();
        assert_eq!(domain.properties["registrar"], json!("Example Registrar, Inc."));
        assert_eq!(
            domain.properties["name_servers"],
            json!(["a.iana-servers.net", "b.iana-servers.net"])
        );

        assert!(client
            .get_rel(
                &fingerprint("Domain", "example.com"),
                &fingerprint("Organization", "Example Registrar, Inc."),
                "REGISTERED_BY",
                "sk1"
            )
            .is_some());
    }
}
