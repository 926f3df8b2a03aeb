use serde_json::Value;
use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest. Every identifier in the protocol is one of these
/// (or an Ed25519 public key of the same width).
pub type Hash = [u8; 32];

/// Serialize a JSON value to canonical bytes: object keys sorted
/// lexicographically, no insignificant whitespace, UTF-8 output.
///
/// `exclude_fields` drops the named top-level keys before encoding; this is
/// how signature payloads are derived from signed transactions.
///
/// Sorting relies on `serde_json`'s default `BTreeMap`-backed object map, so
/// the result is independent of insertion order at every nesting level.
pub fn canonicalize(value: &Value, exclude_fields: &[&str]) -> Vec<u8> {
    let trimmed = match value {
        Value::Object(map) if !exclude_fields.is_empty() => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !exclude_fields.contains(&key.as_str()))
                .map(|(key, val)| (key.clone(), val.clone()))
                .collect();
            Value::Object(filtered)
        }
        other => other.clone(),
    };
    serde_json::to_vec(&trimmed).unwrap()
}

/// Compute a SHA-256 digest.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of the canonical serialization.
pub fn hash_value(value: &Value, exclude_fields: &[&str]) -> Hash {
    sha256(&canonicalize(value, exclude_fields))
}
