//! Sanitize JSON props before they are handed to a sandboxed component.
//!
//! Rejects keys like `__proto__`, `constructor`, and `prototype` that could be
//! used to pollute Object.prototype inside the isolate, and bounds nesting.

use crate::error::PropsError;
use serde_json::Value;

/// Maximum recursion depth for nested objects/arrays
pub const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Check mount props. The top level must be an object; the entry component
/// receives it as its props.
pub fn sanitize_props(value: Value) -> Result<Value, PropsError> {
    match value {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => {
            check(&value, 0)?;
            Ok(value)
        }
        _ => Err(PropsError::NotAnObject),
    }
}

fn check(value: &Value, depth: usize) -> Result<(), PropsError> {
    if depth > MAX_DEPTH {
        return Err(PropsError::TooDeep(MAX_DEPTH));
    }

    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| DANGEROUS_KEYS.contains(&k.as_str())) {
                return Err(PropsError::ForbiddenKey(key.clone()));
            }
            map.values().try_for_each(|v| check(v, depth + 1))
        }
        Value::Array(items) => items.iter().try_for_each(|v| check(v, depth + 1)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_props() {
        let props = json!({
            "label": "Sign in",
            "user": {
                "name": "Alice",
                "settings": {
                    "theme": "dark"
                }
            },
            "items": [1, 2, {"nested": true}]
        });

        assert_eq!(sanitize_props(props.clone()).unwrap(), props);
    }

    #[test]
    fn test_null_means_no_props() {
        assert_eq!(sanitize_props(Value::Null).unwrap(), json!({}));
    }

    #[test]
    fn test_rejects_non_objects() {
        assert_eq!(sanitize_props(json!([1, 2])), Err(PropsError::NotAnObject));
        assert_eq!(sanitize_props(json!("x")), Err(PropsError::NotAnObject));
    }

    #[test]
    fn test_blocks_proto() {
        let result = sanitize_props(json!({ "__proto__": {"polluted": true} }));
        assert_eq!(result, Err(PropsError::ForbiddenKey("__proto__".into())));
    }

    #[test]
    fn test_blocks_constructor() {
        let result = sanitize_props(json!({ "constructor": {"prototype": {}} }));
        assert_eq!(result, Err(PropsError::ForbiddenKey("constructor".into())));
    }

    #[test]
    fn test_blocks_nested_proto() {
        let props = json!({
            "safe": {
                "nested": {
                    "__proto__": {"polluted": true}
                }
            }
        });

        assert!(sanitize_props(props).is_err());
    }

    #[test]
    fn test_blocks_proto_in_array() {
        let props = json!({
            "items": [
                {"safe": true},
                {"__proto__": {"polluted": true}}
            ]
        });

        assert!(sanitize_props(props).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"leaf": true});
        for _ in 0..35 {
            value = json!({"nested": value});
        }

        assert_eq!(sanitize_props(value), Err(PropsError::TooDeep(MAX_DEPTH)));
    }
}
