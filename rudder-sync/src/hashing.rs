//! Manifest normalization and content hashing.
//!
//! Two manifests are equal for diff purposes when their normalized forms
//! hash the same. Normalization removes every field the target environment
//! owns (given as JSON pointers) and prunes maps left empty by the removal.
//! `serde_json` keeps object keys sorted, so the serialized form is
//! canonical and the hash is independent of source key order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// A copy of `manifest` without the fields at `ignore`.
pub fn normalize(manifest: &Value, ignore: &[&str]) -> Value {
    let mut out = manifest.clone();
    for pointer in ignore {
        remove_pointer(&mut out, pointer);
    }
    prune_empty(&mut out);
    out
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn content_hash(value: &Value) -> String {
    let mut h = Sha256::new();
    h.update(value.to_string().as_bytes());
    hex::encode(h.finalize())
}

/// `normalize` then `content_hash`.
pub fn manifest_hash(manifest: &Value, ignore: &[&str]) -> String {
    content_hash(&normalize(manifest, ignore))
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let last = last.replace("~1", "/").replace("~0", "~");
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    if let Some(map) = target.and_then(Value::as_object_mut) {
        map.remove(&last);
    }
}

/// Drop empty maps and nulls, recursively.
fn prune_empty(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            prune_empty(child);
        }
        map.retain(|_, v| match v {
            Value::Null => false,
            Value::Object(m) => !m.is_empty(),
            _ => true,
        });
    } else if let Value::Array(items) = value {
        for item in items {
            prune_empty(item);
        }
    }
}
