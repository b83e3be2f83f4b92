//! Canonical JSON encoding.
//!
//! Shared by config fingerprinting and the audit recorder's HMAC
//! fingerprints: the same payload must always canonicalize to the same
//! bytes, regardless of struct field order or map iteration order.

use serde::Serialize;
use serde_json::Value as Json;

/// Serialize `value` to JSON and recursively sort every object's keys,
/// returning the canonical string form.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    let sorted = sort_keys(json);
    serde_json::to_string(&sorted)
}

fn sort_keys(value: Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut entries: Vec<(String, Json)> = map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Json::Object(entries.into_iter().collect())
        }
        Json::Array(items) => Json::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_form() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn nested_objects_are_sorted_recursively() {
        let a = json!({"outer": {"z": 1, "y": 2}});
        let b = json!({"outer": {"y": 2, "z": 1}});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }
}
