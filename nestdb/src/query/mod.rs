// Filter language - parsed once into a Filter tree, evaluated per document

pub mod options;

pub use options::{FindOptions, Projection, SortDirection, SortSpec};

use crate::document::{compare_values, get_field, get_path, values_equal, Document};
use crate::error::{NestDbError, Result};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Comparison used by [`Filter::Range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            RangeOp::Gt => ordering == Ordering::Greater,
            RangeOp::Gte => ordering != Ordering::Less,
            RangeOp::Lt => ordering == Ordering::Less,
            RangeOp::Lte => ordering != Ordering::Greater,
        }
    }
}

/// Anything a filter can be evaluated against: whole documents, or bare
/// values such as array elements under `$elemMatch`.
pub trait FieldSource {
    fn lookup(&self, path: &str) -> Option<&Value>;
}

impl FieldSource for Value {
    fn lookup(&self, path: &str) -> Option<&Value> {
        get_path(self, path)
    }
}

impl FieldSource for Document {
    fn lookup(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return None;
        }
        get_field(self, path)
    }
}

/// A parsed filter expression. Paths are dot-separated; an empty path refers
/// to the value under test itself (used inside `$elemMatch`).
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches everything.
    All,
    Equals { path: String, value: Value },
    NotEquals { path: String, value: Value },
    Range { path: String, op: RangeOp, value: Value },
    In { path: String, values: Vec<Value> },
    NotIn { path: String, values: Vec<Value> },
    Exists { path: String, exists: bool },
    Regex { path: String, regex: Regex },
    ElemMatch { path: String, filter: Box<Filter> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Parse a filter description. `null` and `{}` match every document.
    pub fn parse(description: &Value) -> Result<Filter> {
        match description {
            Value::Null => Ok(Filter::All),
            Value::Object(map) => parse_conditions(map, ""),
            other => Err(NestDbError::InvalidQuery(format!(
                "filter must be an object, got {other}"
            ))),
        }
    }

    /// Filter matching a single document id.
    pub fn by_id(id: &str) -> Filter {
        Filter::Equals {
            path: crate::document::ID_FIELD.to_string(),
            value: Value::String(id.to_string()),
        }
    }

    /// Parse a condition on a single array element, as used by `$elemMatch`
    /// and `$pull`: either an operator map or a filter over object elements.
    pub fn parse_element(condition: &Value) -> Result<Filter> {
        parse_elem_match(condition)
    }

    pub fn matches<S: FieldSource + ?Sized>(&self, value: &S) -> bool {
        match self {
            Filter::All => true,
            Filter::Equals { path, value: expected } => match value.lookup(path) {
                Some(actual) => values_equal(actual, expected),
                None => expected.is_null(),
            },
            Filter::NotEquals { path, value: expected } => match value.lookup(path) {
                Some(actual) => !values_equal(actual, expected),
                None => !expected.is_null(),
            },
            Filter::Range { path, op, value: bound } => value.lookup(path)
                .and_then(|actual| compare_values(actual, bound))
                .map(|ordering| op.accepts(ordering))
                .unwrap_or(false),
            Filter::In { path, values } => match value.lookup(path) {
                Some(actual) => values.iter().any(|v| values_equal(actual, v)),
                None => values.iter().any(Value::is_null),
            },
            Filter::NotIn { path, values } => match value.lookup(path) {
                Some(actual) => !values.iter().any(|v| values_equal(actual, v)),
                None => !values.iter().any(Value::is_null),
            },
            Filter::Exists { path, exists } => value.lookup(path).is_some() == *exists,
            Filter::Regex { path, regex } => value.lookup(path)
                .and_then(Value::as_str)
                .map(|s| regex.is_match(s))
                .unwrap_or(false),
            Filter::ElemMatch { path, filter } => match value.lookup(path) {
                Some(Value::Array(items)) => items.iter().any(|item| filter.matches(item)),
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches(value)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(value)),
        }
    }

    /// Top-level equality conditions with scalar operands. Any one of them
    /// can narrow candidates through an index on its path.
    pub fn equality_conditions(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Equals { path, value } if is_indexable(value) => {
                vec![(path.as_str(), value)]
            }
            Filter::And(filters) => filters
                .iter()
                .flat_map(|f| match f {
                    Filter::Equals { path, value } if is_indexable(value) => {
                        vec![(path.as_str(), value)]
                    }
                    _ => Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn is_indexable(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn parse_conditions(map: &Map<String, Value>, prefix: &str) -> Result<Filter> {
    let mut filters = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "$or" | "$and" => {
                let branches = value.as_array().ok_or_else(|| {
                    NestDbError::InvalidQuery(format!("{key} expects an array of filters"))
                })?;
                let parsed = branches
                    .iter()
                    .map(|branch| match branch {
                        Value::Object(inner) => parse_conditions(inner, prefix),
                        other => Err(NestDbError::InvalidQuery(format!(
                            "{key} branch must be an object, got {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                filters.push(if key == "$or" {
                    Filter::Or(parsed)
                } else {
                    Filter::And(parsed)
                });
            }
            op if op.starts_with('$') => {
                return Err(NestDbError::InvalidQuery(format!(
                    "unknown top-level operator '{op}'"
                )))
            }
            field => {
                let path = join_path(prefix, field);
                filters.extend(parse_field(&path, value)?);
            }
        }
    }
    Ok(match filters.len() {
        0 => Filter::All,
        1 => filters.remove(0),
        _ => Filter::And(filters),
    })
}

fn is_operator_map(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_field(path: &str, condition: &Value) -> Result<Vec<Filter>> {
    if !is_operator_map(condition) {
        return Ok(vec![Filter::Equals {
            path: path.to_string(),
            value: condition.clone(),
        }]);
    }
    parse_operators(path, condition.as_object().into_iter().flatten())
}

fn parse_operators<'a>(
    path: &str,
    ops: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Result<Vec<Filter>> {
    let ops: Vec<(&String, &Value)> = ops.collect();
    let options = ops
        .iter()
        .find(|(op, _)| op.as_str() == "$options")
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("");

    let mut filters = Vec::new();
    for (op, operand) in &ops {
        let path = path.to_string();
        let filter = match op.as_str() {
            "$eq" => Filter::Equals { path, value: (*operand).clone() },
            "$ne" => Filter::NotEquals { path, value: (*operand).clone() },
            "$gt" => Filter::Range { path, op: RangeOp::Gt, value: (*operand).clone() },
            "$gte" => Filter::Range { path, op: RangeOp::Gte, value: (*operand).clone() },
            "$lt" => Filter::Range { path, op: RangeOp::Lt, value: (*operand).clone() },
            "$lte" => Filter::Range { path, op: RangeOp::Lte, value: (*operand).clone() },
            "$in" => Filter::In { path, values: operand_list(op, operand)? },
            "$nin" => Filter::NotIn { path, values: operand_list(op, operand)? },
            "$exists" => Filter::Exists { path, exists: truthy(operand) },
            "$regex" => Filter::Regex { path, regex: build_regex(operand, options)? },
            "$options" => continue,
            "$elemMatch" => Filter::ElemMatch {
                path,
                filter: Box::new(parse_elem_match(operand)?),
            },
            other => {
                return Err(NestDbError::InvalidQuery(format!(
                    "unknown operator '{other}' on field '{path}'"
                )))
            }
        };
        filters.push(filter);
    }
    Ok(filters)
}

/// `$elemMatch` accepts either a filter over object elements or an operator
/// map applied to each element directly (`{"$gt": 5}`).
fn parse_elem_match(operand: &Value) -> Result<Filter> {
    let map = operand.as_object().ok_or_else(|| {
        NestDbError::InvalidQuery("$elemMatch expects an object".to_string())
    })?;
    let direct = map
        .keys()
        .all(|k| k.starts_with('$') && k != "$or" && k != "$and");
    if direct && !map.is_empty() {
        let mut filters = parse_operators("", map.iter())?;
        return Ok(if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::And(filters)
        });
    }
    parse_conditions(map, "")
}

fn operand_list(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| NestDbError::InvalidQuery(format!("{op} expects an array")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

fn build_regex(pattern: &Value, options: &str) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| NestDbError::InvalidQuery("$regex expects a string".to_string()))?;
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| NestDbError::InvalidQuery(format!("invalid $regex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(filter: Value, doc: Value) -> bool {
        Filter::parse(&filter).unwrap().matches(&doc)
    }

    #[test]
    fn test_literal_equality() {
        let doc = json!({ "name": "Alice", "age": 30 });
        assert!(matches(json!({ "name": "Alice" }), doc.clone()));
        assert!(!matches(json!({ "name": "Bob" }), doc.clone()));
        assert!(matches(json!({ "age": 30.0 }), doc));
    }

    #[test]
    fn test_array_literal_is_structural() {
        let doc = json!({ "tags": ["a", "b"] });
        assert!(matches(json!({ "tags": ["a", "b"] }), doc.clone()));
        assert!(!matches(json!({ "tags": ["a"] }), doc.clone()));
        assert!(!matches(json!({ "tags": "a" }), doc));
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({ "score": 20 });
        assert!(matches(json!({ "score": { "$gt": 15 } }), doc.clone()));
        assert!(matches(json!({ "score": { "$gte": 20, "$lte": 20 } }), doc.clone()));
        assert!(!matches(json!({ "score": { "$lt": 20 } }), doc.clone()));
        assert!(!matches(json!({ "score": { "$gt": "10" } }), doc));
    }

    #[test]
    fn test_missing_field_semantics() {
        let doc = json!({ "name": "A" });
        assert!(matches(json!({ "email": null }), doc.clone()));
        assert!(matches(json!({ "email": { "$ne": "x" } }), doc.clone()));
        assert!(matches(json!({ "email": { "$nin": ["x"] } }), doc.clone()));
        assert!(!matches(json!({ "email": { "$gt": 0 } }), doc.clone()));
        assert!(matches(json!({ "email": { "$exists": false } }), doc));
    }

    #[test]
    fn test_in_and_nin() {
        let doc = json!({ "role": "admin" });
        assert!(matches(json!({ "role": { "$in": ["admin", "owner"] } }), doc.clone()));
        assert!(!matches(json!({ "role": { "$nin": ["admin"] } }), doc.clone()));
        assert!(Filter::parse(&json!({ "role": { "$in": "admin" } })).is_err());
    }

    #[test]
    fn test_regex_with_options() {
        let doc = json!({ "email": "Alice@Example.com" });
        assert!(matches(json!({ "email": { "$regex": "example\\.com$", "$options": "i" } }), doc.clone()));
        assert!(!matches(json!({ "email": { "$regex": "example\\.com$" } }), doc));
    }

    #[test]
    fn test_dot_paths() {
        let doc = json!({ "address": { "city": "Oslo" } });
        assert!(matches(json!({ "address.city": "Oslo" }), doc.clone()));
        assert!(!matches(json!({ "address.zip": { "$exists": true } }), doc));
    }

    #[test]
    fn test_elem_match() {
        let doc = json!({
            "items": [ { "sku": "a", "qty": 1 }, { "sku": "b", "qty": 9 } ],
            "scores": [3, 8]
        });
        assert!(matches(json!({ "items": { "$elemMatch": { "sku": "b", "qty": { "$gt": 5 } } } }), doc.clone()));
        assert!(!matches(json!({ "items": { "$elemMatch": { "sku": "a", "qty": { "$gt": 5 } } } }), doc.clone()));
        assert!(matches(json!({ "scores": { "$elemMatch": { "$gte": 8 } } }), doc));
    }

    #[test]
    fn test_logical_combinators() {
        let doc = json!({ "name": "A", "score": 10 });
        assert!(matches(json!({ "$or": [ { "name": "B" }, { "score": 10 } ] }), doc.clone()));
        assert!(!matches(json!({ "$and": [ { "name": "A" }, { "score": 11 } ] }), doc));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        assert!(Filter::parse(&json!({ "a": { "$near": 1 } })).is_err());
        assert!(Filter::parse(&json!({ "$nor": [] })).is_err());
        assert!(Filter::parse(&json!([1])).is_err());
    }

    #[test]
    fn test_equality_conditions() {
        let filter = Filter::parse(&json!({ "email": "a@x.io", "age": { "$gt": 3 }, "tags": ["x"] })).unwrap();
        let conditions = filter.equality_conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].0, "email");

        let filter = Filter::parse(&json!({ "$or": [ { "email": "a" } ] })).unwrap();
        assert!(filter.equality_conditions().is_empty());
    }
}
