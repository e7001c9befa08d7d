use crate::error::{invalid_argument, FirestoreResult};
use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Maximum nesting depth of maps inside a document. Arrays are transparent
/// unless they contain maps.
pub const MAX_MAP_DEPTH: usize = 20;

/// Approximate serialized-size ceiling per document.
pub const MAX_DOCUMENT_BYTES: usize = 1 << 20;

/// Validates a document's field tree against the depth and size limits,
/// naming the offending field path on failure.
pub fn validate_document(fields: &MapValue) -> FirestoreResult<()> {
    let mut size = 32;
    for (key, value) in fields.fields() {
        check_depth(value, 1, key)?;
        size += key.len() + 1 + value_size(value);
    }
    if size > MAX_DOCUMENT_BYTES {
        return Err(invalid_argument(format!(
            "Document exceeds the maximum size of {MAX_DOCUMENT_BYTES} bytes ({size} bytes)"
        )));
    }
    Ok(())
}

fn check_depth(value: &FirestoreValue, depth: usize, path: &str) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Map(map) => {
            if depth >= MAX_MAP_DEPTH {
                return Err(invalid_argument(format!(
                    "Field \"{path}\" exceeds the maximum nesting depth of {MAX_MAP_DEPTH}"
                )));
            }
            for (key, child) in map.fields() {
                check_depth(child, depth + 1, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        ValueKind::Array(array) => {
            // Arrays do not consume a nesting level themselves.
            for child in array.values() {
                check_depth(child, depth, path)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Mirrors the backend's documented storage-size accounting closely enough
/// for limit enforcement.
fn value_size(value: &FirestoreValue) -> usize {
    match value.kind() {
        ValueKind::Null | ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) => 8,
        ValueKind::String(s) => s.len() + 1,
        ValueKind::Bytes(b) => b.len(),
        ValueKind::Reference(r) => r.len() + 16,
        ValueKind::GeoPoint(_) => 16,
        ValueKind::Array(array) => array.values().iter().map(value_size).sum(),
        ValueKind::Vector(vector) => vector.dimensions() * 8,
        ValueKind::Map(map) => map
            .fields()
            .iter()
            .map(|(key, child)| key.len() + 1 + value_size(child))
            .sum(),
        ValueKind::Sentinel(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn nested_map(levels: usize) -> FirestoreValue {
        let mut value = FirestoreValue::from_integer(1);
        for _ in 0..levels {
            let mut map = BTreeMap::new();
            map.insert("n".to_string(), value);
            value = FirestoreValue::from_map(map);
        }
        value
    }

    #[test]
    fn accepts_twenty_levels() {
        let mut root = BTreeMap::new();
        root.insert("n".to_string(), nested_map(19));
        assert!(validate_document(&MapValue::new(root)).is_ok());
    }

    #[test]
    fn rejects_deeper_nesting() {
        let mut root = BTreeMap::new();
        root.insert("n".to_string(), nested_map(20));
        let err = validate_document(&MapValue::new(root)).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(err.message().contains("nesting depth"));
    }

    #[test]
    fn arrays_are_transparent_for_depth() {
        let mut root = BTreeMap::new();
        root.insert(
            "a".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_array(vec![nested_map(19)])]),
        );
        assert!(validate_document(&MapValue::new(root)).is_ok());
    }

    #[test]
    fn rejects_oversized_document() {
        let mut root = BTreeMap::new();
        root.insert(
            "blob".to_string(),
            FirestoreValue::from_string("x".repeat(MAX_DOCUMENT_BYTES)),
        );
        let err = validate_document(&MapValue::new(root)).unwrap_err();
        assert!(err.message().contains("maximum size"));
    }
}
