//! Shallow/deep metadata codec and the containment leaf splitter.
//!
//! Legacy clients store metadata as a flat string-to-string map. The search
//! service exposes arbitrary JSON objects. The codec maps between the two:
//! string values pass through, everything else is marshalled under a
//! `"json:"`-prefixed key.

use crate::error::{Error, Result};
use crate::location::JsonMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Key prefix marking a shallow value that holds marshalled JSON.
pub const JSON_PREFIX: &str = "json:";

/// Convert a deep JSON object into the shallow string-to-string form.
///
/// Example: `{"foo":"1", "bar":[2]}` becomes `{"foo":"1", "json:bar":"[2]"}`.
/// Empty input yields `None`.
///
/// A genuine top-level key that already starts with `"json:"` is not
/// detected and will not round-trip.
pub fn to_shallow(meta: &JsonMap) -> Result<Option<BTreeMap<String, String>>> {
    if meta.is_empty() {
        return Ok(None);
    }

    let mut result = BTreeMap::new();
    for (k, v) in meta {
        match v {
            Value::String(s) => {
                result.insert(k.clone(), s.clone());
            }
            other => {
                let marshalled = serde_json::to_string(other)
                    .map_err(|e| Error::InvalidMetadata(e.to_string()))?;
                result.insert(format!("{JSON_PREFIX}{k}"), marshalled);
            }
        }
    }
    Ok(Some(result))
}

/// Convert shallow string-to-string metadata back into a deep JSON object.
///
/// Example: `{"foo":"1", "json:bar":"[2]"}` becomes `{"foo":"1", "bar":[2]}`.
/// Empty input yields `None`.
pub fn to_deep(meta: &BTreeMap<String, String>) -> Result<Option<JsonMap>> {
    if meta.is_empty() {
        return Ok(None);
    }

    let mut result = JsonMap::new();
    for (k, v) in meta {
        if let Some(stripped) = k.strip_prefix(JSON_PREFIX) {
            let parsed: Value =
                serde_json::from_str(v).map_err(|e| Error::InvalidMetadata(e.to_string()))?;
            result.insert(stripped.to_string(), parsed);
        } else {
            result.insert(k.clone(), Value::String(v.clone()));
        }
    }
    Ok(Some(result))
}

/// Decompose an arbitrary JSON value into single-path containment leaves.
///
/// Each leaf is a JSON document describing one root-to-scalar path of the
/// input; a document contains the input iff it contains every leaf. An empty
/// object or array produces no leaves.
pub fn split_to_leaves(value: &Value) -> Vec<Value> {
    let mut leaves = Vec::new();
    collect_leaves(value, &mut |leaf| leaves.push(leaf));
    leaves
}

fn collect_leaves(value: &Value, emit: &mut dyn FnMut(Value)) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                collect_leaves(v, &mut |leaf| {
                    let mut wrapped = JsonMap::new();
                    wrapped.insert(k.clone(), leaf);
                    emit(Value::Object(wrapped));
                });
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_leaves(v, &mut |leaf| emit(Value::Array(vec![leaf])));
            }
        }
        scalar => emit(scalar.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn shallow_deep_round_trip() {
        let deep = as_map(json!({
            "stringValue": "foo",
            "boolValue": true,
            "intValue": 1,
            "arrayValue": [1, 2, 3],
            "objValue": {"foo": 1},
        }));

        let shallow = to_shallow(&deep).unwrap().unwrap();
        assert_eq!(shallow.get("stringValue").unwrap(), "foo");
        assert_eq!(shallow.get("json:intValue").unwrap(), "1");

        let deep2 = to_deep(&shallow).unwrap().unwrap();
        assert_eq!(Value::Object(deep), Value::Object(deep2));
    }

    #[test]
    fn empty_metadata_maps_to_none() {
        assert!(to_shallow(&JsonMap::new()).unwrap().is_none());
        assert!(to_deep(&BTreeMap::new()).unwrap().is_none());
    }

    #[test]
    fn to_deep_rejects_malformed_marshalled_values() {
        let mut shallow = BTreeMap::new();
        shallow.insert("json:bad".to_string(), "{not json".to_string());
        assert!(to_deep(&shallow).is_err());
    }

    #[test]
    fn split_to_leaves_decomposes_nested_objects() {
        let input = json!({
            "key1": "value1",
            "key2": {
                "key3": "value3",
                "key4": [1, 2, {"key5": "value5", "key6": "value6"}],
            },
        });

        let expected = vec![
            json!({"key1": "value1"}),
            json!({"key2": {"key3": "value3"}}),
            json!({"key2": {"key4": [1]}}),
            json!({"key2": {"key4": [2]}}),
            json!({"key2": {"key4": [{"key5": "value5"}]}}),
            json!({"key2": {"key4": [{"key6": "value6"}]}}),
        ];

        let mut actual = split_to_leaves(&input);
        actual.sort_by_key(|v| v.to_string());
        let mut expected = expected;
        expected.sort_by_key(|v| v.to_string());
        assert_eq!(actual, expected);
    }

    #[test]
    fn split_to_leaves_of_scalar_is_the_scalar() {
        assert_eq!(split_to_leaves(&json!("x")), vec![json!("x")]);
        assert_eq!(split_to_leaves(&json!(7)), vec![json!(7)]);
    }

    #[test]
    fn split_to_leaves_of_empty_object_is_empty() {
        assert!(split_to_leaves(&json!({})).is_empty());
        assert!(split_to_leaves(&json!([])).is_empty());
    }
}
