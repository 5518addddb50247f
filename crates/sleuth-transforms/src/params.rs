use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use tracing::error;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::types::{OwnerId, ParamSpec};
use sleuth_vault::SecretVault;

/// Resolve a transform's declared parameters from caller-supplied values,
/// the vault, and declared defaults.
///
/// For a vaulted-secret parameter the lookup order is: vault by
/// caller-supplied secret reference, vault by parameter name, declared
/// default. A required vaulted parameter that stays unresolved is logged
/// with a named, actionable message and resolution continues; strict
/// validation catches it afterwards. A vault authentication failure is
/// not a miss and propagates immediately.
pub fn resolve(
    transform_name: &str,
    specs: &[ParamSpec],
    caller: &Map<String, Value>,
    secret_refs: &BTreeMap<String, String>,
    vault: Option<&SecretVault>,
    owner: Option<&OwnerId>,
) -> Result<Map<String, Value>> {
    let mut resolved = caller.clone();

    for spec in specs {
        if spec.secret {
            let mut found: Option<String> = None;
            if let (Some(vault), Some(owner)) = (vault, owner) {
                if let Some(reference) = secret_refs.get(&spec.name) {
                    found = vault.get_secret(owner, reference)?;
                }
                if found.is_none() {
                    found = vault.get_secret(owner, &spec.name)?;
                }
            }

            match found {
                Some(secret) => {
                    resolved.insert(spec.name.clone(), Value::String(secret));
                }
                None => {
                    if !resolved.contains_key(&spec.name) {
                        if let Some(default) = &spec.default {
                            resolved.insert(spec.name.clone(), default.clone());
                        } else if spec.required {
                            error!(
                                transform = transform_name,
                                param = %spec.name,
                                "Required vaulted parameter unresolved; store a secret named \
                                 '{}' for this account or pass an explicit secret reference",
                                spec.name
                            );
                        }
                    }
                }
            }
        } else if !resolved.contains_key(&spec.name) {
            if let Some(default) = &spec.default {
                resolved.insert(spec.name.clone(), default.clone());
            }
        }
    }

    Ok(resolved)
}

/// Strictly validate a fully resolved parameter set: unknown keys are
/// rejected and every required parameter must be present.
pub fn validate(
    transform_name: &str,
    specs: &[ParamSpec],
    resolved: &Map<String, Value>,
) -> Result<()> {
    let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();

    for key in resolved.keys() {
        if !known.contains(key.as_str()) {
            return Err(SleuthError::Validation {
                transform: transform_name.to_string(),
                message: format!("unknown parameter '{}'", key),
            });
        }
    }

    for spec in specs {
        if spec.required && !resolved.contains_key(&spec.name) {
            return Err(SleuthError::Validation {
                transform: transform_name.to_string(),
                message: format!("missing required parameter '{}'", spec.name),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;
    use sleuth_core::config::VaultConfig;

    fn vault() -> SecretVault {
        let config = VaultConfig {
            master_key: Some(base64::engine::general_purpose::STANDARD.encode([5u8; 32])),
            key_version: "V1".into(),
        };
        SecretVault::in_memory(&config).unwrap()
    }

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("api_key", "service key").required().secret(),
            ParamSpec::new("limit", "max results").with_default(json!(100)),
        ]
    }

    #[test]
    fn defaults_fill_missing_plain_params() {
        let resolved = resolve(
            "t",
            &specs(),
            &Map::new(),
            &BTreeMap::new(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(resolved["limit"], json!(100));
    }

    #[test]
    fn caller_value_beats_default() {
        let mut caller = Map::new();
        caller.insert("limit".into(), json!(5));
        let resolved = resolve("t", &specs(), &caller, &BTreeMap::new(), None, None).unwrap();
        assert_eq!(resolved["limit"], json!(5));
    }

    #[test]
    fn secret_resolves_by_param_name() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");
        vault.set_secret(&owner, "api_key", "vaulted").unwrap();

        let resolved = resolve(
            "t",
            &specs(),
            &Map::new(),
            &BTreeMap::new(),
            Some(&vault),
            Some(&owner),
        )
        .unwrap();
        assert_eq!(resolved["api_key"], json!("vaulted"));
    }

    #[test]
    fn secret_reference_beats_param_name() {
        let vault = vault();
        let owner = OwnerId::from_string("alice");
        vault.set_secret(&owner, "api_key", "by-name").unwrap();
        vault.set_secret(&owner, "prod_key", "by-reference").unwrap();

        let mut refs = BTreeMap::new();
        refs.insert("api_key".to_string(), "prod_key".to_string());

        let resolved = resolve(
            "t",
            &specs(),
            &Map::new(),
            &refs,
            Some(&vault),
            Some(&owner),
        )
        .unwrap();
        assert_eq!(resolved["api_key"], json!("by-reference"));
    }

    #[test]
    fn unresolved_required_secret_continues_resolution() {
        let resolved = resolve(
            "t",
            &specs(),
            &Map::new(),
            &BTreeMap::new(),
            None,
            None,
        )
        .unwrap();
        // api_key absent, but the other parameter still resolved
        assert!(!resolved.contains_key("api_key"));
        assert_eq!(resolved["limit"], json!(100));
    }

    #[test]
    fn validate_rejects_unknown_keys() {
        let mut resolved = Map::new();
        resolved.insert("api_key".into(), json!("x"));
        resolved.insert("bogus".into(), json!(1));

        let err = validate("t", &specs(), &resolved).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'bogus'"));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let mut resolved = Map::new();
        resolved.insert("limit".into(), json!(100));

        let err = validate("t", &specs(), &resolved).unwrap_err();
        assert!(err.to_string().contains("missing required parameter 'api_key'"));
    }

    #[test]
    fn validate_accepts_complete_set() {
        let mut resolved = Map::new();
        resolved.insert("api_key".into(), json!("x"));
        resolved.insert("limit".into(), json!(100));
        assert!(validate("t", &specs(), &resolved).is_ok());
    }
}
