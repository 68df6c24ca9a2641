/// Canonical JSON and revision-id generation.
///
/// Revision ids must be a pure function of `(parent_rev, body, deleted)` so
/// that every replica derives the same id for the same edit. The hash input
/// is the canonical JSON rendering of the body: keys sorted
/// lexicographically, no insignificant whitespace, UTF-8.
use md5::{Digest, Md5};
use serde_json::Value;

use crate::revision::Revision;

/// Render a JSON value canonically: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string rendering handles escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derive the revision id for a new child of `parent`.
///
/// The hash covers the canonical body, the parent revision id, and the
/// deleted flag; the generation is `parent.pos + 1` (1 for a root).
pub fn new_rev_id(parent: Option<&Revision>, body: &Value, deleted: bool) -> Revision {
    let mut hasher = Md5::new();
    hasher.update(canonical_json(body).as_bytes());
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update(if deleted { b"1" } else { b"0" });

    let digest = hasher.finalize();
    let hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let pos = parent.map(|p| p.pos + 1).unwrap_or(1);
    Revision::new(pos, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "y": null}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_preserves_array_order() {
        let value = serde_json::json!([3, 1, 2]);
        assert_eq!(canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn rev_id_is_deterministic() {
        let body = serde_json::json!({"name": "Tom", "age": 31});
        let a = new_rev_id(None, &body, false);
        let b = new_rev_id(None, &body, false);
        assert_eq!(a, b);
        assert_eq!(a.pos, 1);
        assert_eq!(a.hash.len(), 32);
    }

    #[test]
    fn rev_id_key_order_does_not_matter() {
        let a = serde_json::from_str::<Value>(r#"{"x":1,"y":2}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(new_rev_id(None, &a, false), new_rev_id(None, &b, false));
    }

    #[test]
    fn rev_id_depends_on_parent_and_deleted() {
        let body = serde_json::json!({"v": 1});
        let root = new_rev_id(None, &body, false);
        let child = new_rev_id(Some(&root), &body, false);
        let tombstone = new_rev_id(Some(&root), &serde_json::json!({}), true);

        assert_eq!(child.pos, 2);
        assert_ne!(root.hash, child.hash);
        assert_ne!(child.hash, tombstone.hash);
    }
}
