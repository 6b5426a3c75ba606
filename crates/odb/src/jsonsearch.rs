//! Structured-value search over a record's canonical JSON projection.
//!
//! Walks a `serde_json::Value` depth-first, building a path string of the
//! form `/field/@index/...`. At every scalar leaf (string, number, bool,
//! null) it tests the caller's predicate against the leaf's string form:
//! numbers as their literal text, booleans as `true`/`false`, null as the
//! literal `"null"`, strings raw. The full path to each matching leaf is
//! collected, in depth-first order.

use serde_json::Value;

/// Depth-first walk matching every scalar leaf of `value` against `pred`;
/// returns the paths of all matches.
pub fn search_paths(value: &Value, pred: &dyn Fn(&str) -> bool) -> Vec<String> {
    let mut hits = Vec::new();
    walk(value, String::new(), pred, &mut hits);
    hits
}

fn walk(value: &Value, path: String, pred: &dyn Fn(&str) -> bool, hits: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                walk(v, format!("{path}/{key}"), pred, hits);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk(v, format!("{path}/@{i}"), pred, hits);
            }
        }
        Value::String(s) => {
            if pred(s) {
                hits.push(path);
            }
        }
        Value::Number(n) => {
            if pred(&n.to_string()) {
                hits.push(path);
            }
        }
        Value::Bool(b) => {
            if pred(if *b { "true" } else { "false" }) {
                hits.push(path);
            }
        }
        Value::Null => {
            if pred("null") {
                hits.push(path);
            }
        }
    }
}

/// A substring predicate — the only search mode the design offers
/// (full-text ranking is explicitly out of scope).
pub fn contains(needle: &str) -> impl Fn(&str) -> bool + '_ {
    move |haystack: &str| haystack.contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_scalar_leaves() {
        let value = json!({
            "description": "met with Staffan Olsson yesterday",
            "labels": ["a", "b"],
            "nested": { "flag": true, "count": 3, "missing": null }
        });
        let hits = search_paths(&value, &contains("Staffan Olsson"));
        assert_eq!(hits, vec!["/description".to_string()]);

        let hits = search_paths(&value, &contains("b"));
        assert_eq!(hits, vec!["/labels/@1".to_string()]);

        let hits = search_paths(&value, &|s: &str| s == "true");
        assert_eq!(hits, vec!["/nested/flag".to_string()]);

        let hits = search_paths(&value, &|s: &str| s == "null");
        assert_eq!(hits, vec!["/nested/missing".to_string()]);
    }

    #[test]
    fn no_match_yields_no_hits() {
        let value = json!({"a": "b"});
        assert!(search_paths(&value, &contains("zzz")).is_empty());
    }
}
