//! Versioned canonicalization and hashing.
//!
//! Content hashes are computed over an ordered list of `(field name, value)`
//! pairs followed by the entry's ordering value and its predecessor's hash.
//! Every component is length-prefixed and type-tagged, so two different field
//! lists can never produce the same byte string.
//!
//! The encoding is versioned. Entries store the version they were hashed with
//! (`hash_version`), and new field sets must ship as a new version rather than
//! editing an existing one: old entries have to stay re-verifiable.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// `previous_hash` of the first entry in any chain.
pub const GENESIS_HASH: &str = "genesis";

/// Version used for newly appended entries.
pub const CURRENT_HASH_VERSION: u32 = 1;

const V1_HEADER: &[u8] = b"ledgerkeep-canonical/v1\n";

/// A single hashed value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    /// Arbitrary JSON, encoded with recursively sorted keys.
    Json(Value),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Null => b'n',
            FieldValue::Bool(_) => b'b',
            FieldValue::Int(_) => b'i',
            FieldValue::UInt(_) => b'u',
            FieldValue::Text(_) => b's',
            FieldValue::Json(_) => b'j',
        }
    }

    fn render(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::UInt(u) => u.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Json(v) => canonical_json(v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<u64> for FieldValue {
    fn from(u: u64) -> Self {
        FieldValue::UInt(u)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Uuid> for FieldValue {
    fn from(id: Uuid) -> Self {
        FieldValue::Text(id.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(ts: DateTime<Utc>) -> Self {
        FieldValue::Text(crate::time::format(&ts))
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Json(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Ordered list of hashed fields. Order is part of the hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalFields(Vec<(&'static str, FieldValue)>);

impl CanonicalFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field (builder style).
    pub fn with(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        debug_assert!(
            !name.starts_with('_'),
            "field names starting with '_' are reserved"
        );
        self.0.push((name, value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn push_component(out: &mut Vec<u8>, name: &str, value: &FieldValue) {
    let rendered = value.render();
    out.extend_from_slice(format!("{}:", name.len()).as_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(value.tag());
    out.extend_from_slice(format!("{}:", rendered.len()).as_bytes());
    out.extend_from_slice(rendered.as_bytes());
    out.push(b'\n');
}

/// Canonical byte string for the given version, or `None` if the version is unknown.
pub fn canonicalize(
    version: u32,
    fields: &CanonicalFields,
    ordering_value: &FieldValue,
    previous_hash: &str,
) -> Option<Vec<u8>> {
    match version {
        1 => {
            let mut out = V1_HEADER.to_vec();
            for (name, value) in &fields.0 {
                push_component(&mut out, name, value);
            }
            push_component(&mut out, "_ordering", ordering_value);
            push_component(&mut out, "_previous_hash", &FieldValue::from(previous_hash));
            Some(out)
        }
        _ => None,
    }
}

/// SHA-256 content hash (lowercase hex), or `None` for an unknown version.
pub fn content_hash(
    version: u32,
    fields: &CanonicalFields,
    ordering_value: &FieldValue,
    previous_hash: &str,
) -> Option<String> {
    canonicalize(version, fields, ordering_value, previous_hash).map(|bytes| sha256_hex(&bytes))
}

/// Fingerprint of an entire JSON record (canonical JSON, SHA-256 hex).
pub fn fingerprint(record: &Value) -> String {
    sha256_hex(canonical_json(record).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Serialize JSON with object keys sorted at every depth.
///
/// Does not rely on serde_json's map ordering, which changes if any crate in
/// the build enables `preserve_order`.
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
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CanonicalFields {
        CanonicalFields::new()
            .with("id", "abc")
            .with("event_type", "document.uploaded")
            .with("event_data", json!({"b": 1, "a": [true, null]}))
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = content_hash(1, &sample(), &FieldValue::UInt(7), GENESIS_HASH).unwrap();
        let b = content_hash(1, &sample(), &FieldValue::UInt(7), GENESIS_HASH).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_covers_ordering_and_previous() {
        let base = content_hash(1, &sample(), &FieldValue::UInt(7), GENESIS_HASH).unwrap();
        let other_seq = content_hash(1, &sample(), &FieldValue::UInt(8), GENESIS_HASH).unwrap();
        let other_prev = content_hash(1, &sample(), &FieldValue::UInt(7), "deadbeef").unwrap();
        assert_ne!(base, other_seq);
        assert_ne!(base, other_prev);
    }

    #[test]
    fn test_separator_injection_does_not_collide() {
        // With naive "a|b" joining these two would hash identically.
        let one = CanonicalFields::new().with("q", "x|y").with("r", "z");
        let two = CanonicalFields::new().with("q", "x").with("r", "y|z");
        let h1 = content_hash(1, &one, &FieldValue::Null, GENESIS_HASH).unwrap();
        let h2 = content_hash(1, &two, &FieldValue::Null, GENESIS_HASH).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_type_tags_distinguish_values() {
        let text = CanonicalFields::new().with("n", "1");
        let num = CanonicalFields::new().with("n", 1u64);
        assert_ne!(
            content_hash(1, &text, &FieldValue::Null, GENESIS_HASH),
            content_hash(1, &num, &FieldValue::Null, GENESIS_HASH)
        );
    }

    #[test]
    fn test_unknown_version() {
        assert!(content_hash(99, &sample(), &FieldValue::Null, GENESIS_HASH).is_none());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v = json!({"z": {"b": 2, "a": 1}, "a": "x"});
        assert_eq!(canonical_json(&v), r#"{"a":"x","z":{"a":1,"b":2}}"#);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"id":"1","name":"n"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"name":"n","id":"1"}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
