// Document helpers - ids, timestamps, dot-path access and value ordering

use crate::error::{NestDbError, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// A stored document: an insertion-ordered mapping of field name to value.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

/// Generate a 24-hex-character document id: 8 chars of second-resolution
/// Unix time followed by 16 chars of randomness.
pub fn generate_id() -> String {
    let secs = Utc::now().timestamp().max(0) as u32;
    let random = uuid::Uuid::new_v4();
    let mut id = format!("{secs:08x}");
    for byte in &random.as_bytes()[..8] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Whether `s` looks like a generated document id.
pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert an arbitrary JSON value into a document, rejecting non-objects.
pub fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(NestDbError::InvalidDocument(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

/// Read the `_id` of a document, if it is a string.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Resolve a dot-separated path. An empty path resolves to the value itself;
/// numeric segments index into arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Same as [`get_path`] but starting from a document.
pub fn get_field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => return doc.get(path),
    };
    get_path(doc.get(head)?, rest)
}

/// Set a value at a dot path, creating intermediate objects as needed.
pub fn set_field(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        doc.insert(first.to_string(), value);
        return Ok(());
    }

    let mut current = doc
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    for (i, segment) in rest.iter().enumerate() {
        let last = i == rest.len() - 1;
        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), value);
                    return Ok(());
                }
                map.entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            Value::Array(items) => {
                let idx = segment
                    .parse::<usize>()
                    .ok()
                    .filter(|idx| *idx < items.len())
                    .ok_or_else(|| {
                        NestDbError::InvalidUpdate(format!(
                            "cannot address '{segment}' inside array at '{path}'"
                        ))
                    })?;
                if last {
                    items[idx] = value;
                    return Ok(());
                }
                &mut items[idx]
            }
            other => {
                return Err(NestDbError::InvalidUpdate(format!(
                    "cannot create field '{segment}' in {} at '{path}'",
                    type_name(other)
                )))
            }
        };
    }
    Ok(())
}

/// Remove the value at a dot path. Returns the removed value, if any.
pub fn remove_field(doc: &mut Document, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        None => return doc.shift_remove(leaf),
        Some(parent) => get_field_mut(doc, parent)?,
    };
    match parent {
        Value::Object(map) => map.shift_remove(leaf),
        _ => None,
    }
}

fn get_field_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = doc.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Exact identity of a JSON number. Integral floats share the integer form,
/// so `10` and `10.0` are the same key while `2^53 + 1` and `2^53 as f64`
/// stay apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberKey {
    Int(i128),
    Float(u64),
}

impl NumberKey {
    pub fn of(n: &Number) -> NumberKey {
        if let Some(i) = n.as_i64() {
            return NumberKey::Int(i128::from(i));
        }
        if let Some(u) = n.as_u64() {
            return NumberKey::Int(i128::from(u));
        }
        let f = n.as_f64().unwrap_or(f64::NAN);
        if f.fract() == 0.0 && f.abs() < i128::MAX as f64 {
            NumberKey::Int(f as i128)
        } else {
            NumberKey::Float(f.to_bits())
        }
    }
}

/// Structural equality. Numbers compare exactly by value (`1` equals `1.0`)
/// and objects ignore key order.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => NumberKey::of(x) == NumberKey::of(y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Compare two values of the same kind. Returns `None` for values that have
/// no meaningful order between them (mixed types, objects, arrays).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: missing/null first, then numbers, strings,
/// objects, arrays and booleans.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y) {
                let ord = sort_order(Some(l), Some(r));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y) {
                let ord = kx.cmp(ky).then_with(|| sort_order(Some(vx), Some(vy)));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 24);
        assert!(is_object_id(&id));
        assert_ne!(id, generate_id());
    }

    #[test]
    fn test_id_prefix_is_timestamp() {
        let id = generate_id();
        let secs = u32::from_str_radix(&id[..8], 16).unwrap() as i64;
        assert!((Utc::now().timestamp() - secs).abs() <= 2);
    }

    #[test]
    fn test_get_nested_path() {
        let value = json!({ "a": { "b": [10, { "c": "x" }] } });
        assert_eq!(get_path(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(get_path(&value, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(get_path(&value, "a.missing"), None);
        assert_eq!(get_path(&value, ""), Some(&value));
    }

    #[test]
    fn test_set_and_remove_nested() {
        let mut doc = into_document(json!({ "name": "A" })).unwrap();
        set_field(&mut doc, "profile.city", json!("Oslo")).unwrap();
        assert_eq!(get_field(&doc, "profile.city"), Some(&json!("Oslo")));

        assert_eq!(remove_field(&mut doc, "profile.city"), Some(json!("Oslo")));
        assert_eq!(doc.get("profile"), Some(&json!({})));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = into_document(json!({ "name": "A" })).unwrap();
        assert!(set_field(&mut doc, "name.first", json!("x")).is_err());
    }

    #[test]
    fn test_values_equal_numbers_and_key_order() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({ "a": 1, "b": 2 }), &json!({ "b": 2, "a": 1 })));
        assert!(!values_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = json!(9007199254740993_i64);
        assert!(!values_equal(&big, &json!(9007199254740992.0)));
        assert!(values_equal(&json!(9007199254740992_i64), &json!(9007199254740992.0)));
        assert!(values_equal(&json!(u64::MAX), &json!(u64::MAX)));
        assert!(values_equal(&json!(-0.0), &json!(0)));
    }

    #[test]
    fn test_sort_order_ranks_types() {
        assert_eq!(sort_order(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!(2)), Some(&json!("a"))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(sort_order(Some(&json!(true)), Some(&json!([1]))), Ordering::Greater);
    }
}
