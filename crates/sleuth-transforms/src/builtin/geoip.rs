use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert};

const IP_API: &str = "http://ip-api.com/json";

/// Geolocates IP addresses via ip-api.com.
pub struct IpGeolocateTransform;

#[derive(Deserialize)]
struct GeoResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, rename = "countryCode")]
    country_code: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default, rename = "as")]
    asn: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

impl Transform for IpGeolocateTransform {
    fn name(&self) -> &str {
        "ip_geolocate"
    }

    fn category(&self) -> &str {
        "infrastructure"
    }

    fn key(&self) -> &str {
        "ip"
    }

    fn description(&self) -> &str {
        "Geolocate IP addresses, including ISP and AS details."
    }

    fn icon(&self) -> &str {
        "map-pin"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ip": { "type": "string" } },
            "required": ["ip"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ip": { "type": "string" },
                "country": { "type": "string" },
                "city": { "type": "string" },
                "lat": { "type": "number" },
                "lon": { "type": "number" },
                "isp": { "type": "string" },
                "org": { "type": "string" },
                "asn": { "type": "string" }
            }
        })
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        _params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .user_agent("Sleuth/0.3")
                .build()
                .map_err(|e| SleuthError::TransformRuntime {
                    transform: "ip_geolocate".into(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let mut results = Vec::new();
            for value in values {
                let Some(ip) = value.as_str() else {
                    continue;
                };

                let url = format!(
                    "{}/{}?fields=status,message,country,countryCode,city,lat,lon,isp,org,as,query",
                    IP_API, ip
                );
                let resp = client.get(&url).send().await.map_err(|e| {
                    SleuthError::TransformRuntime {
                        transform: "ip_geolocate".into(),
                        message: format!("ip-api request failed: {}", e),
                    }
                })?;

                let geo: GeoResponse = match resp.json().await {
                    Ok(geo) => geo,
                    Err(e) => {
                        debug!(ip, error = %e, "Malformed geolocation response");
                        continue;
                    }
                };

                if geo.status != "success" {
                    debug!(ip, message = ?geo.message, "Geolocation lookup failed");
                    continue;
                }

                results.push(json!({
                    "ip": geo.query.as_deref().unwrap_or(ip),
                    "country": geo.country,
                    "country_code": geo.country_code,
                    "city": geo.city,
                    "lat": geo.lat,
                    "lon": geo.lon,
                    "isp": geo.isp,
                    "org": geo.org,
                    "asn": geo.asn,
                }));
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
                let Some(ip) = result.get("ip").and_then(Value::as_str) else {
                    continue;
                };
                let ip_fp = fingerprint("IpAddress", ip);

                let mut props = Map::new();
                for field in ["country", "country_code", "city", "lat", "lon", "isp", "org", "asn"]
                {
                    if let Some(v) = result.get(field) {
                        props.insert(field.to_string(), v.clone());
                    }
                }

                sink.upsert_node(NodeUpsert {
                    entity_type: "IpAddress".into(),
                    key_prop: "ip".into(),
                    key_value: json!(ip),
                    fingerprint: ip_fp.clone(),
                    properties: Value::Object(props),
                })
                .await?;

                if let Some(name) = location_name(result) {
                    let loc_fp = fingerprint("Location", &name);
                    sink.upsert_node(NodeUpsert {
                        entity_type: "Location".into(),
                        key_prop: "name".into(),
                        key_value: json!(name),
                        fingerprint: loc_fp.clone(),
                        properties: json!({
                            "country": result.get("country").cloned(),
                            "city": result.get("city").cloned(),
                        }),
                    })
                    .await?;

                    sink.upsert_relationship(EdgeUpsert {
                        from_type: "IpAddress".into(),
                        from_fingerprint: ip_fp,
                        to_type: "Location".into(),
                        to_fingerprint: loc_fp,
                        rel_type: "LOCATED_IN".into(),
                        properties: json!({ "source": "ip-api" }),
                    })
                    .await?;
                }
            }
            Ok(results)
        })
    }
}

/// "City, Country" when both are known, country alone otherwise.
fn location_name(result: &Value) -> Option<String> {
    let country = result.get("country").and_then(Value::as_str)?;
    match result.get("city").and_then(Value::as_str) {
        Some(city) if !city.is_empty() => Some(format!("{}, {}", city, country)),
        _ => Some(country.to_string()),
    }
}
