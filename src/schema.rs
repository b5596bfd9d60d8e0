//! Versioned schema registry: validate a payload against a
//! `(entity_type, version)` key, humanize failures, and derive the key a
//! message should be checked against from its headers and payload.

use crate::codec;
use crate::error::{FieldError, ValidationError};
use crate::model::{headers as h, Headers};
use serde_json::Value;
use std::collections::HashMap;

pub type SchemaKey = (String, i32);

pub const INFERENCE_REQUEST: &str = "InferenceRequest";
pub const NODE_TELEMETRY: &str = "NodeTelemetry";
pub const DISPATCH_COMMAND: &str = "DispatchCommand";

type Validator = Box<dyn Fn(&Value) -> Vec<FieldError> + Send + Sync>;

/// Registry of schema validators, declared in code and enumerable at startup.
pub struct SchemaRegistry {
    validators: HashMap<SchemaKey, Validator>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_builtin_schemas()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// The registry arc-scheduler actually ships: inference requests v1/v2,
    /// node telemetry v1, dispatch commands v1.
    pub fn with_builtin_schemas() -> Self {
        let mut reg = Self::new();
        reg.register(INFERENCE_REQUEST, 1, validate_inference_request);
        reg.register(INFERENCE_REQUEST, 2, validate_inference_request);
        reg.register(NODE_TELEMETRY, 1, validate_node_telemetry);
        reg.register(DISPATCH_COMMAND, 1, validate_dispatch_command);
        reg
    }

    pub fn register(
        &mut self,
        entity_type: &str,
        version: i32,
        validator: impl Fn(&Value) -> Vec<FieldError> + Send + Sync + 'static,
    ) {
        self.validators
            .insert((entity_type.to_string(), version), Box::new(validator));
    }

    pub fn registered_versions(&self, entity_type: &str) -> Vec<i32> {
        let mut versions: Vec<i32> = self
            .validators
            .keys()
            .filter(|(e, _)| e == entity_type)
            .map(|(_, v)| *v)
            .collect();
        versions.sort_unstable();
        versions
    }

    /// `validate(schema_key, value) → (ok | errors)`.
    pub fn validate(&self, key: &SchemaKey, value: &Value) -> Result<(), Vec<FieldError>> {
        let validator = self
            .validators
            .get(key)
            .ok_or_else(|| vec![FieldError {
                path: "$".to_string(),
                reason: format!("no schema registered for {} v{}", key.0, key.1),
            }])?;
        let errors = validator(value);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate_or_fail`: returns the value on success, raises otherwise.
    pub fn validate_or_fail(&self, key: &SchemaKey, value: Value) -> Result<Value, ValidationError> {
        match self.validate(key, &value) {
            Ok(()) => Ok(value),
            Err(errors) => Err(ValidationError {
                entity_type: key.0.clone(),
                version: key.1,
                errors,
            }),
        }
    }
}

/// `schema_key_of(headers, payload)`: headers win, payload's
/// `schema_version` is the fallback; missing either side means "raw, no
/// validation".
pub fn schema_key_of(headers: &Headers, payload: &Value) -> Option<SchemaKey> {
    let entity_type = headers
        .get(h::ENTITY_TYPE)
        .and_then(|b| codec::string_decode(b).ok())?;

    let version = headers
        .get(h::SCHEMA_VERSION)
        .and_then(|b| codec::int32_be_decode(b).ok())
        .or_else(|| payload.get("schema_version").and_then(Value::as_i64).map(|v| v as i32))?;

    Some((entity_type, version))
}

fn require_string<'a>(value: &'a Value, field: &str, errors: &mut Vec<FieldError>) -> Option<&'a str> {
    match value.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Some(s),
        Some(_) => {
            errors.push(FieldError {
                path: field.to_string(),
                reason: "must not be empty".to_string(),
            });
            None
        }
        None => {
            errors.push(FieldError {
                path: field.to_string(),
                reason: "missing or not a string".to_string(),
            });
            None
        }
    }
}

fn require_positive_u64(value: &Value, field: &str, errors: &mut Vec<FieldError>) {
    match value.get(field).and_then(Value::as_u64) {
        Some(n) if n > 0 => {}
        Some(_) => errors.push(FieldError {
            path: field.to_string(),
            reason: "must be > 0".to_string(),
        }),
        None => errors.push(FieldError {
            path: field.to_string(),
            reason: "missing or not a non-negative integer".to_string(),
        }),
    }
}

fn require_unit_interval(value: &Value, field: &str, errors: &mut Vec<FieldError>) {
    match value.get(field).and_then(Value::as_f64) {
        Some(n) if (0.0..=1.0).contains(&n) => {}
        Some(n) => errors.push(FieldError {
            path: field.to_string(),
            reason: format!("must be within [0.0, 1.0], got {n}"),
        }),
        None => errors.push(FieldError {
            path: field.to_string(),
            reason: "missing or not a number".to_string(),
        }),
    }
}

fn validate_inference_request(value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    require_string(value, "id", &mut errors);
    require_string(value, "model_id", &mut errors);
    require_positive_u64(value, "context_window_tokens", &mut errors);
    require_positive_u64(value, "max_latency_ms", &mut errors);
    require_string(value, "requester_geozone", &mut errors);

    match value.get("priority").and_then(Value::as_str) {
        Some("critical") | Some("normal") | Some("background") => {}
        Some(other) => errors.push(FieldError {
            path: "priority".to_string(),
            reason: format!("unrecognized priority '{other}'"),
        }),
        None => errors.push(FieldError {
            path: "priority".to_string(),
            reason: "missing".to_string(),
        }),
    }

    if let Some(v) = value.get("schema_version").and_then(Value::as_i64) {
        if !crate::model::REQUEST_SCHEMA_VERSIONS.contains(&(v as i32)) {
            errors.push(FieldError {
                path: "schema_version".to_string(),
                reason: format!("unrecognized schema version {v}"),
            });
        }
    }

    errors
}

fn validate_node_telemetry(value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    require_string(value, "node_id", &mut errors);
    require_string(value, "geozone", &mut errors);

    if let Some(geohash) = require_string(value, "geohash", &mut errors) {
        if !crate::geo::is_valid_geohash(geohash) {
            errors.push(FieldError {
                path: "geohash".to_string(),
                reason: "must be 6 lowercase base32 characters".to_string(),
            });
        }
    }

    require_unit_interval(value, "battery_level", &mut errors);
    require_unit_interval(value, "gpu_utilization", &mut errors);

    match value.get("energy_source").and_then(Value::as_str) {
        Some("solar") | Some("grid") | Some("battery") => {}
        Some(other) => errors.push(FieldError {
            path: "energy_source".to_string(),
            reason: format!("unrecognized energy source '{other}'"),
        }),
        None => errors.push(FieldError {
            path: "energy_source".to_string(),
            reason: "missing".to_string(),
        }),
    }

    errors
}

fn validate_dispatch_command(value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    require_string(value, "id", &mut errors);
    require_string(value, "request_id", &mut errors);
    require_string(value, "node_id", &mut errors);
    require_string(value, "model_id", &mut errors);
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_inference_request_passes() {
        let reg = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "id": "11111111-1111-1111-1111-111111111111",
            "schema_version": 1,
            "model_id": "llama-70b",
            "context_window_tokens": 4096,
            "priority": "normal",
            "max_latency_ms": 500,
            "requester_geozone": "9q8yyk",
        });
        let key = (INFERENCE_REQUEST.to_string(), 1);
        assert!(reg.validate(&key, &payload).is_ok());
    }

    #[test]
    fn missing_fields_are_humanized() {
        let reg = SchemaRegistry::with_builtin_schemas();
        let payload = json!({ "id": "x" });
        let key = (INFERENCE_REQUEST.to_string(), 1);
        let err = reg.validate_or_fail(&key, payload).unwrap_err();
        assert!(err.to_string().contains("model_id"));
        assert!(!err.errors.is_empty());
    }

    #[test]
    fn schema_key_prefers_headers_over_payload() {
        let mut headers = Headers::new();
        headers.insert(h::ENTITY_TYPE.to_string(), codec::string_encode(INFERENCE_REQUEST));
        headers.insert(h::SCHEMA_VERSION.to_string(), codec::int32_be_encode(2).to_vec());
        let payload = json!({ "schema_version": 1 });
        let key = schema_key_of(&headers, &payload).unwrap();
        assert_eq!(key, (INFERENCE_REQUEST.to_string(), 2));
    }

    #[test]
    fn schema_key_falls_back_to_payload_version() {
        let mut headers = Headers::new();
        headers.insert(h::ENTITY_TYPE.to_string(), codec::string_encode(INFERENCE_REQUEST));
        let payload = json!({ "schema_version": 2 });
        let key = schema_key_of(&headers, &payload).unwrap();
        assert_eq!(key, (INFERENCE_REQUEST.to_string(), 2));
    }

    #[test]
    fn missing_entity_type_is_raw() {
        let headers = Headers::new();
        let payload = json!({ "schema_version": 1 });
        assert!(schema_key_of(&headers, &payload).is_none());
    }

    #[test]
    fn registered_versions_enumerates_sorted() {
        let reg = SchemaRegistry::with_builtin_schemas();
        assert_eq!(reg.registered_versions(INFERENCE_REQUEST), vec![1, 2]);
    }
}
