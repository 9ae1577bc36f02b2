//! Document representation and path helpers for transform callbacks.

use serde_json::{Map, Value};

/// A database document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// A lazy, single-pass stream of documents.
pub type DocumentStream = futures::stream::BoxStream<'static, crate::errors::Result<Document>>;

/// Returns the document's `_id` field, if present.
pub fn doc_id(doc: &Document) -> Option<&Value> {
    doc.get("_id")
}

/// Sets a value at a nested path, creating intermediate objects as needed.
///
/// Intermediate fields that are not objects are overwritten with empty
/// objects. Returns `false` when the path is empty.
pub fn deep_set(doc: &mut Document, path: &[&str], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = doc;
    for key in parents {
        let slot = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(next) => current = next,
            _ => return false,
        }
    }
    current.insert((*last).to_string(), value);
    true
}

/// Removes and returns the value at a nested path.
///
/// Returns `None` when any intermediate step is missing or not an object.
pub fn deep_remove(doc: &mut Document, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = doc;
    for key in parents {
        current = current.get_mut(*key)?.as_object_mut()?;
    }
    current.remove(*last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn deep_set_creates_intermediate_objects() {
        let mut d = doc(json!({"a": 1}));
        assert!(deep_set(&mut d, &["b", "c"], json!(2)));
        assert_eq!(Value::Object(d), json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn deep_set_overwrites_non_object_intermediates() {
        let mut d = doc(json!({"a": 5}));
        assert!(deep_set(&mut d, &["a", "b"], json!(true)));
        assert_eq!(Value::Object(d), json!({"a": {"b": true}}));
    }

    #[test]
    fn deep_set_rejects_empty_path() {
        let mut d = doc(json!({}));
        assert!(!deep_set(&mut d, &[], json!(1)));
    }

    #[test]
    fn deep_remove_returns_removed_value() {
        let mut d = doc(json!({"a": {"b": {"c": 3}}}));
        assert_eq!(deep_remove(&mut d, &["a", "b", "c"]), Some(json!(3)));
        assert_eq!(Value::Object(d), json!({"a": {"b": {}}}));
    }

    #[test]
    fn deep_remove_missing_path_is_none() {
        let mut d = doc(json!({"a": 1}));
        assert_eq!(deep_remove(&mut d, &["a", "b"]), None);
        assert_eq!(deep_remove(&mut d, &["x"]), None);
    }

    #[test]
    fn doc_id_reads_underscore_id() {
        let d = doc(json!({"_id": 7, "x": 1}));
        assert_eq!(doc_id(&d), Some(&json!(7)));
    }
}
