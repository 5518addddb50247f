use serde_json::{Map, Value};

/// Normalize an arbitrary structured value into a graph-store-primitive
/// property map.
///
/// The underlying store accepts only primitive scalars and arrays of
/// primitives, so: nested records flatten into `parentKey_childKey`
/// entries, arrays of primitives pass through, arrays containing
/// non-primitives are stringified element-wise, nulls are dropped, and
/// any other non-primitive is stringified.
pub fn serialize_properties(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(&mut out, key, child);
            }
        }
        Value::Null => {}
        other => {
            out.insert("value".to_string(), primitive_or_string(other));
        }
    }
    out
}

fn flatten_into(out: &mut Map<String, Value>, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (child_key, child) in map {
                flatten_into(out, &format!("{}_{}", key, child_key), child);
            }
        }
        Value::Array(items) => {
            let serialized: Vec<Value> = items
                .iter()
                .map(primitive_or_string)
                .collect();
            out.insert(key.to_string(), Value::Array(serialized));
        }
        primitive => {
            out.insert(key.to_string(), primitive.clone());
        }
    }
}

fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_)
    )
}

fn primitive_or_string(value: &Value) -> Value {
    if is_primitive(value) {
        value.clone()
    } else if value.is_null() {
        Value::String(String::new())
    } else {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_pass_through() {
        let props = serialize_properties(&json!({
            "domain": "example.com",
            "ttl": 300,
            "wildcard": false,
        }));
        assert_eq!(props["domain"], json!("example.com"));
        assert_eq!(props["ttl"], json!(300));
        assert_eq!(props["wildcard"], json!(false));
    }

    #[test]
    fn nested_records_flatten() {
        let props = serialize_properties(&json!({
            "registrar": {"name": "Example Inc", "country": {"code": "US"}},
        }));
        assert_eq!(props["registrar_name"], json!("Example Inc"));
        assert_eq!(props["registrar_country_code"], json!("US"));
        assert!(!props.contains_key("registrar"));
    }

    #[test]
    fn primitive_arrays_pass_through() {
        let props = serialize_properties(&json!({"ips": ["1.1.1.1", "8.8.8.8"]}));
        assert_eq!(props["ips"], json!(["1.1.1.1", "8.8.8.8"]));
    }

    #[test]
    fn mixed_arrays_stringify_elements() {
        let props = serialize_properties(&json!({"records": ["a", {"type": "MX"}]}));
        assert_eq!(props["records"][0], json!("a"));
        assert_eq!(props["records"][1], json!(r#"{"type":"MX"}"#));
    }

    #[test]
    fn nulls_are_dropped() {
        let props = serialize_properties(&json!({"kept": "x", "dropped": null}));
        assert!(props.contains_key("kept"));
        assert!(!props.contains_key("dropped"));
    }

    #[test]
    fn non_object_roots_wrap_under_value() {
        let props = serialize_properties(&json!("bare"));
        assert_eq!(props["value"], json!("bare"));
    }
}
