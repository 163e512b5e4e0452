//! Normalizes arbitrary caller values into the JSON shapes the store accepts.
//!
//! Accepted shapes are scalars (null, bool, number, string), lists, and maps
//! whose values are themselves accepted shapes. Lists may hold scalars or
//! nested lists, but not maps. Map keys must be embeddable in a JSON path.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{GraphError, Result};

/// Converts `value` into a store-safe [`Value`], rejecting unsupported shapes.
pub fn sanitize<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let value = serde_json::to_value(value)?;
    check(&value, "$")?;
    Ok(value)
}

/// Sanitizes every entry of a string-keyed map.
pub fn sanitize_map<I, K, V>(entries: I) -> Result<Map<String, Value>>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Serialize,
{
    let mut out = Map::new();
    for (key, value) in entries {
        let key = key.into();
        let value = sanitize(&value).map_err(|err| match err {
            GraphError::InvalidArgument(message) => {
                GraphError::InvalidArgument(format!("key '{key}': {message}"))
            }
            other => other,
        })?;
        out.insert(key, value);
    }
    Ok(out)
}

/// Returns `true` when `key` can be embedded in a JSON path literal.
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| !c.is_control() && c != '"' && c != '\'' && c != '\\')
}

fn check(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) | Value::Number(_) => Ok(()),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                if item.is_object() {
                    return Err(GraphError::InvalidArgument(format!(
                        "{path}[{idx}]: lists may not contain maps"
                    )));
                }
                check(item, &format!("{path}[{idx}]"))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                if !is_safe_key(key) {
                    return Err(GraphError::InvalidArgument(format!(
                        "{path}: unsupported key {key:?}"
                    )));
                }
                check(item, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
    }
}
