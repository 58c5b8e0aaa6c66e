//! Recursive key substitution over decoded JSON payloads

use serde_json::Value;

/// Key carrying the gateway identity in ChirpStack-style gateway events
pub const GATEWAY_ID_KEY: &str = "gatewayID";

/// Replace the value bound to `key` everywhere in the tree.
///
/// Matching keys are replaced without descending into their old value;
/// every other map value and every list element is visited. Returns the
/// number of replacements made.
pub fn rewrite(payload: &mut Value, key: &str, new_value: &str) -> usize {
    match payload {
        Value::Object(map) => {
            let mut replaced = 0;
            for (k, v) in map.iter_mut() {
                if k == key {
                    *v = Value::String(new_value.to_string());
                    replaced += 1;
                } else {
                    replaced += rewrite(v, key, new_value);
                }
            }
            replaced
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite(item, key, new_value))
            .sum(),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rewrite_replaces_every_occurrence() {
        let mut payload = json!({"a": {"gatewayID": "X", "b": [{"gatewayID": "Y"}]}});
        let replaced = rewrite(&mut payload, GATEWAY_ID_KEY, "Z");

        assert_eq!(replaced, 2);
        assert_eq!(
            payload,
            json!({"a": {"gatewayID": "Z", "b": [{"gatewayID": "Z"}]}})
        );
    }

    #[test]
    fn test_rewrite_leaves_other_values_untouched() {
        let mut payload = json!({
            "gatewayID": "old",
            "rssi": -57,
            "loRaSNR": 7.5,
            "crcStatus": true,
            "context": null,
            "tags": ["gatewayID", 1]
        });
        rewrite(&mut payload, GATEWAY_ID_KEY, "new");

        assert_eq!(
            payload,
            json!({
                "gatewayID": "new",
                "rssi": -57,
                "loRaSNR": 7.5,
                "crcStatus": true,
                "context": null,
                "tags": ["gatewayID", 1]
            })
        );
    }

    #[test]
    fn test_rewrite_replaces_non_string_values() {
        let mut payload = json!({"gatewayID": {"nested": {"gatewayID": 1}}, "x": [null]});
        let replaced = rewrite(&mut payload, GATEWAY_ID_KEY, "Z");

        // The old subtree is replaced wholesale, not visited
        assert_eq!(replaced, 1);
        assert_eq!(payload, json!({"gatewayID": "Z", "x": [null]}));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let mut once = json!({"rxInfo": [{"gatewayID": "a"}, {"gatewayID": "b"}]});
        rewrite(&mut once, GATEWAY_ID_KEY, "Z");
        let mut twice = once.clone();
        rewrite(&mut twice, GATEWAY_ID_KEY, "Z");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_without_key_is_noop() {
        let mut payload = json!({"a": [1, 2, {"b": "c"}]});
        let original = payload.clone();
        assert_eq!(rewrite(&mut payload, GATEWAY_ID_KEY, "Z"), 0);
        assert_eq!(payload, original);
    }

    #[test]
    fn test_rewrite_scalar_root() {
        let mut payload = json!("gatewayID");
        assert_eq!(rewrite(&mut payload, GATEWAY_ID_KEY, "Z"), 0);
        assert_eq!(payload, json!("gatewayID"));
    }

    #[test]
    fn test_rewrite_preserves_key_order() {
        let mut payload: Value =
            serde_json::from_str(r#"{"z":1,"gatewayID":"a","m":2,"b":3}"#).unwrap();
        rewrite(&mut payload, GATEWAY_ID_KEY, "Z");
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"z":1,"gatewayID":"Z","m":2,"b":3}"#
        );
    }

    #[test]
    fn test_rewrite_deeply_nested_lists() {
        let mut payload = json!([[[{"gatewayID": "a"}]], [{"x": {"gatewayID": "b"}}]]);
        assert_eq!(rewrite(&mut payload, GATEWAY_ID_KEY, "Z"), 2);
        assert_eq!(
            payload,
            json!([[[{"gatewayID": "Z"}]], [{"x": {"gatewayID": "Z"}}]])
        );
    }
}
