// Result shaping - sort, skip/limit and projection

use crate::document::{get_field, remove_field, sort_order, Document, ID_FIELD};
use crate::error::{NestDbError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordered list of sort keys, evaluated left to right.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec {
    pub keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Ascending));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Descending));
        self
    }

    /// Parse `{"score": -1, "name": 1}`. Key order is significant.
    pub fn parse(description: &Value) -> Result<SortSpec> {
        let map = description.as_object().ok_or_else(|| {
            NestDbError::InvalidQuery("sort must be an object of field: 1|-1".to_string())
        })?;
        let mut spec = SortSpec::new();
        for (field, direction) in map {
            let direction = match direction.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => {
                    return Err(NestDbError::InvalidQuery(format!(
                        "sort direction for '{field}' must be 1 or -1"
                    )))
                }
            };
            spec.keys.push((field.clone(), direction));
        }
        Ok(spec)
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, direction) in &self.keys {
            let ordering = sort_order(get_field(a, field), get_field(b, field));
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable sort: documents equal on every key keep their relative order.
    pub fn apply(&self, docs: &mut [Document]) {
        if !self.keys.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
    }
}

/// Field projection: either an allow-list or a deny-list, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include { fields: Vec<String>, keep_id: bool },
    Exclude(Vec<String>),
}

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Include {
            fields: fields.into_iter().map(Into::into).collect(),
            keep_id: true,
        }
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Exclude(fields.into_iter().map(Into::into).collect())
    }

    /// Parse `{"name": 1, "_id": 0}` or `{"password": 0}`.
    pub fn parse(description: &Value) -> Result<Projection> {
        let map = description.as_object().ok_or_else(|| {
            NestDbError::InvalidQuery("projection must be an object".to_string())
        })?;

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut keep_id = true;
        for (field, flag) in map {
            let include = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                other => {
                    return Err(NestDbError::InvalidQuery(format!(
                        "projection flag for '{field}' must be 0/1 or a boolean, got {other}"
                    )))
                }
            };
            if field == ID_FIELD && !include {
                keep_id = false;
                excluded.push(field.clone());
            } else if include {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }

        if included.is_empty() {
            return Ok(Projection::Exclude(excluded));
        }
        if excluded.iter().any(|f| f != ID_FIELD) {
            return Err(NestDbError::InvalidQuery(
                "projection cannot mix inclusion and exclusion".to_string(),
            ));
        }
        Ok(Projection::Include {
            fields: included,
            keep_id,
        })
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::Include { fields, keep_id } => {
                let mut projected = Document::new();
                if *keep_id {
                    if let Some(id) = doc.get(ID_FIELD) {
                        projected.insert(ID_FIELD.to_string(), id.clone());
                    }
                }
                for field in fields {
                    copy_path(doc, &mut projected, field);
                }
                projected
            }
            Projection::Exclude(fields) => {
                let mut projected = doc.clone();
                for field in fields {
                    remove_field(&mut projected, field);
                }
                projected
            }
        }
    }
}

/// Copy the value at `path` from `source` into `target`, creating parent
/// objects as needed. Paths that step through anything but objects (array
/// positions included) are left out.
fn copy_path(source: &Document, target: &mut Document, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut from = source;
    let mut to = target;
    while let Some(segment) = segments.next() {
        let Some(value) = from.get(segment) else {
            return;
        };
        if segments.peek().is_none() {
            to.insert(segment.to_string(), value.clone());
            return;
        }
        let Value::Object(next_from) = value else {
            return;
        };
        let Value::Object(next_to) = to
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()))
        else {
            return;
        };
        from = next_from;
        to = next_to;
    }
}

/// Options for `find`: sort, then skip, then limit, then projection.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub projection: Option<Projection>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Shape an already-filtered result set.
    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if let Some(sort) = &self.sort {
            sort.apply(&mut docs);
        }
        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        let shaped = docs.into_iter().skip(skip).take(limit);
        match &self.projection {
            Some(projection) => shaped.map(|doc| projection.apply(&doc)).collect(),
            None => shaped.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::into_document;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values.into_iter().map(|v| into_document(v).unwrap()).collect()
    }

    fn names(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d["name"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_multi_key_sort() {
        let mut set = docs(vec![
            json!({ "name": "a", "group": 2, "score": 1 }),
            json!({ "name": "b", "group": 1, "score": 5 }),
            json!({ "name": "c", "group": 2, "score": 9 }),
            json!({ "name": "d", "group": 1, "score": 7 }),
        ]);
        SortSpec::new().asc("group").desc("score").apply(&mut set);
        assert_eq!(names(&set), vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let mut set = docs(vec![
            json!({ "name": "first", "k": 1 }),
            json!({ "name": "second", "k": 0 }),
            json!({ "name": "third", "k": 1 }),
            json!({ "name": "fourth", "k": 1 }),
        ]);
        SortSpec::parse(&json!({ "k": -1 })).unwrap().apply(&mut set);
        assert_eq!(names(&set), vec!["first", "third", "fourth", "second"]);
    }

    #[test]
    fn test_sort_rejects_bad_direction() {
        assert!(SortSpec::parse(&json!({ "k": "up" })).is_err());
    }

    #[test]
    fn test_inclusion_projection_keeps_id() {
        let doc = into_document(json!({ "_id": "x", "name": "A", "secret": 1, "a": { "b": 2, "c": 3 } })).unwrap();
        let projection = Projection::parse(&json!({ "name": 1, "a.b": 1 })).unwrap();
        assert_eq!(
            Value::Object(projection.apply(&doc)),
            json!({ "_id": "x", "name": "A", "a": { "b": 2 } })
        );

        let projection = Projection::parse(&json!({ "name": 1, "_id": 0 })).unwrap();
        assert_eq!(Value::Object(projection.apply(&doc)), json!({ "name": "A" }));
    }

    #[test]
    fn test_inclusion_through_array_is_skipped() {
        let doc = into_document(json!({ "_id": "x", "tags": ["a", "b"], "name": "A" })).unwrap();
        let projection = Projection::parse(&json!({ "tags.0": 1, "name": 1 })).unwrap();
        assert_eq!(Value::Object(projection.apply(&doc)), json!({ "_id": "x", "name": "A" }));

        let projection = Projection::parse(&json!({ "tags": 1, "name.first": 1 })).unwrap();
        assert_eq!(Value::Object(projection.apply(&doc)), json!({ "_id": "x", "tags": ["a", "b"] }));
    }

    #[test]
    fn test_exclusion_projection() {
        let doc = into_document(json!({ "_id": "x", "name": "A", "secret": 1 })).unwrap();
        let projection = Projection::parse(&json!({ "secret": 0 })).unwrap();
        assert_eq!(Value::Object(projection.apply(&doc)), json!({ "_id": "x", "name": "A" }));
    }

    #[test]
    fn test_mixed_projection_rejected() {
        assert!(Projection::parse(&json!({ "name": 1, "secret": 0 })).is_err());
    }

    #[test]
    fn test_skip_limit_after_sort() {
        let set = docs(vec![
            json!({ "name": "c", "n": 3 }),
            json!({ "name": "a", "n": 1 }),
            json!({ "name": "b", "n": 2 }),
        ]);
        let options = FindOptions::new().sort(SortSpec::new().asc("n")).skip(1).limit(1);
        assert_eq!(names(&options.apply(set)), vec!["b"]);
    }
}
