// Secondary indexes - field value to document id lists

use crate::document::{document_id, get_field, Document, NumberKey};
use serde_json::Value;
use std::collections::HashMap;

/// Options for `Store::create_index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
}

impl IndexOptions {
    pub fn unique() -> Self {
        IndexOptions { unique: true }
    }
}

/// Hashable form of an indexed value. Two values get the same key exactly
/// when `values_equal` holds between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Bool(bool),
    Number(NumberKey),
    String(String),
    Composite(String),
}

impl IndexKey {
    /// `None` for null values; those are not indexed.
    pub fn from_value(value: &Value) -> Option<IndexKey> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Number(n) => Some(IndexKey::Number(NumberKey::of(n))),
            Value::String(s) => Some(IndexKey::String(s.clone())),
            other => {
                let mut text = String::new();
                write_canonical(other, &mut text);
                Some(IndexKey::Composite(text))
            }
        }
    }
}

// Objects with sorted keys, numbers by NumberKey
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Number(n) => match NumberKey::of(n) {
            NumberKey::Int(i) => out.push_str(&format!("i{i}")),
            NumberKey::Float(bits) => out.push_str(&format!("f{bits:x}")),
        },
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (key, item) in entries {
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
                out.push(',');
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Index over one field of one collection. Documents where the field is
/// missing or null are not indexed, so a unique index allows any number of
/// them.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    field: String,
    unique: bool,
    entries: HashMap<IndexKey, Vec<String>>,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>, unique: bool) -> Self {
        Self {
            field: field.into(),
            unique,
            entries: HashMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Number of distinct indexed values.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Discard current contents and re-scan `docs`.
    pub fn rebuild(&mut self, docs: &[Document]) {
        self.entries.clear();
        for doc in docs {
            let (Some(id), Some(key)) = (document_id(doc), self.key_of(doc)) else {
                continue;
            };
            self.entries.entry(key).or_default().push(id.to_string());
        }
    }

    fn key_of(&self, doc: &Document) -> Option<IndexKey> {
        get_field(doc, &self.field).and_then(IndexKey::from_value)
    }

    /// Ids of documents whose field equals `value`, in insertion order.
    pub fn lookup(&self, value: &Value) -> &[String] {
        IndexKey::from_value(value)
            .and_then(|key| self.entries.get(&key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// For a unique index: the value of `doc` that is already held by an
    /// indexed document.
    pub fn conflicts<'a>(&self, doc: &'a Document) -> Option<&'a Value> {
        if !self.unique {
            return None;
        }
        let value = get_field(doc, &self.field)?;
        let key = IndexKey::from_value(value)?;
        self.entries.contains_key(&key).then_some(value)
    }

    /// First value held by more than one document in `docs`, checked against
    /// this index's field. Used for unique checks over candidate states.
    pub fn first_duplicate<'a>(&self, docs: &'a [Document]) -> Option<&'a Value> {
        let mut seen = HashMap::new();
        for doc in docs {
            let Some(value) = get_field(doc, &self.field) else {
                continue;
            };
            let Some(key) = IndexKey::from_value(value) else {
                continue;
            };
            if seen.insert(key, ()).is_some() {
                return Some(value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::into_document;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        vec![
            into_document(json!({ "_id": "1", "email": "a@x.io", "n": 10 })).unwrap(),
            into_document(json!({ "_id": "2", "email": "b@x.io", "n": 10.0 })).unwrap(),
            into_document(json!({ "_id": "3", "n": 7 })).unwrap(),
        ]
    }

    #[test]
    fn test_rebuild_and_lookup() {
        let mut index = FieldIndex::new("n", false);
        index.rebuild(&docs());
        assert_eq!(index.lookup(&json!(10)), ["1".to_string(), "2".to_string()]);
        assert_eq!(index.lookup(&json!(7)), ["3".to_string()]);
        assert!(index.lookup(&json!(8)).is_empty());
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn test_missing_values_not_indexed() {
        let mut index = FieldIndex::new("email", true);
        index.rebuild(&docs());
        assert_eq!(index.key_count(), 2);
        let no_email = into_document(json!({ "_id": "4" })).unwrap();
        assert!(index.conflicts(&no_email).is_none());
    }

    #[test]
    fn test_unique_conflicts() {
        let mut index = FieldIndex::new("email", true);
        index.rebuild(&docs());
        let dup = into_document(json!({ "_id": "9", "email": "a@x.io" })).unwrap();
        assert_eq!(index.conflicts(&dup), Some(&json!("a@x.io")));
        let fresh = into_document(json!({ "_id": "9", "email": "c@x.io" })).unwrap();
        assert!(index.conflicts(&fresh).is_none());
    }

    #[test]
    fn test_composite_keys_follow_value_equality() {
        let key = |v: Value| IndexKey::from_value(&v);
        assert_eq!(key(json!({ "a": 1, "b": 2 })), key(json!({ "b": 2, "a": 1.0 })));
        assert_eq!(key(json!([1, { "x": [2] }])), key(json!([1.0, { "x": [2.0] }])));
        assert_ne!(key(json!([1, 2])), key(json!([2, 1])));
        assert_ne!(key(json!({ "a": "1" })), key(json!({ "a": 1 })));
        assert_ne!(key(json!(9007199254740993_i64)), key(json!(9007199254740992.0)));
    }

    #[test]
    fn test_first_duplicate() {
        let index = FieldIndex::new("n", true);
        assert_eq!(index.first_duplicate(&docs()), Some(&json!(10.0)));
        let index = FieldIndex::new("email", true);
        assert!(index.first_duplicate(&docs()).is_none());
    }
}
