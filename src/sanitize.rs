//! Guard host payloads before they enter the sandbox.
//!
//! Patch and location payloads are parsed on the Rust side and re-serialized
//! into script calls. Keys like `__proto__`, `constructor` and `prototype`
//! would let the host pollute `Object.prototype` inside the sandbox.

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

/// Maximum recursion depth for nested objects/arrays
const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Parse a serialized host payload and reject dangerous keys.
pub fn parse_payload(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("payload is not valid JSON")?;
    sanitize_payload(value)
}

/// Recursively check a JSON value, erroring if dangerous keys are found.
///
/// # Errors
/// Returns an error if:
/// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
/// - Nesting depth exceeds MAX_DEPTH (32)
pub fn sanitize_payload(value: Value) -> Result<Value> {
    sanitize_recursive(value, 0)
}

fn sanitize_recursive(value: Value, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(anyhow!("payload nesting too deep (max {} levels)", MAX_DEPTH));
    }

    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| DANGEROUS_KEYS.contains(&k.as_str())) {
                return Err(anyhow!("'{}' key is forbidden in payloads", key));
            }

            let mut sanitized = Map::new();
            for (key, val) in map {
                sanitized.insert(key, sanitize_recursive(val, depth + 1)?);
            }
            Ok(Value::Object(sanitized))
        }
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| sanitize_recursive(v, depth + 1))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_patch() {
        let patch = json!({
            "events": [
                {"kind": "ModelChanged", "model": {"id": "m1"}, "attr": "zoom", "new": 13}
            ],
            "references": []
        });

        let result = sanitize_payload(patch.clone()).unwrap();
        assert_eq!(result, patch);
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse_payload("{not json").unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_blocks_proto_in_location() {
        let err = parse_payload(r#"{"search": "?a=1", "__proto__": {"polluted": true}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("__proto__"));
    }

    #[test]
    fn test_blocks_nested_constructor_in_array() {
        let patch = json!({
            "events": [
                {"safe": true},
                {"new": {"constructor": {"prototype": {}}}}
            ]
        });

        assert!(sanitize_payload(patch).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"leaf": true});
        for _ in 0..35 {
            value = json!({"nested": value});
        }

        let err = sanitize_payload(value).unwrap_err();
        assert!(err.to_string().contains("too deep"));
    }
}
