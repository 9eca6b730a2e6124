// Update language - operators parsed once and applied to a copy

use crate::document::{
    get_field, remove_field, set_field, type_name, values_equal, Document, CREATED_AT, ID_FIELD,
    UPDATED_AT,
};
use crate::error::{NestDbError, Result};
use crate::query::Filter;
use serde_json::{Map, Number, Value};

/// Element selector for `$pull`.
#[derive(Debug, Clone)]
pub enum PullCondition {
    Literal(Value),
    Matches(Filter),
}

impl PullCondition {
    fn removes(&self, element: &Value) -> bool {
        match self {
            PullCondition::Literal(value) => values_equal(element, value),
            PullCondition::Matches(filter) => filter.matches(element),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set(Vec<(String, Value)>),
    Unset(Vec<String>),
    Inc(Vec<(String, Number)>),
    Push(Vec<(String, Vec<Value>)>),
    Pull(Vec<(String, PullCondition)>),
    AddToSet(Vec<(String, Vec<Value>)>),
}

/// A parsed update: operators in the order the caller wrote them.
#[derive(Debug, Clone)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn parse(description: &Value) -> Result<Update> {
        let map = description.as_object().ok_or_else(|| {
            NestDbError::InvalidUpdate(format!("update must be an object, got {description}"))
        })?;

        if !map.keys().any(|k| k.starts_with('$')) {
            let fields = map
                .iter()
                .filter(|(k, _)| k.as_str() != ID_FIELD && k.as_str() != CREATED_AT)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Ok(Update {
                ops: vec![UpdateOp::Set(fields)],
            });
        }

        let mut ops = Vec::with_capacity(map.len());
        for (op, operand) in map {
            let fields = operand.as_object().ok_or_else(|| {
                NestDbError::InvalidUpdate(format!("{op} expects an object of field: value"))
            })?;
            for field in fields.keys() {
                if field == ID_FIELD {
                    return Err(NestDbError::InvalidUpdate(format!(
                        "{op} cannot modify '{ID_FIELD}'"
                    )));
                }
            }
            ops.push(match op.as_str() {
                "$set" => UpdateOp::Set(pairs(fields)),
                "$unset" => UpdateOp::Unset(fields.keys().cloned().collect()),
                "$inc" => UpdateOp::Inc(
                    fields
                        .iter()
                        .map(|(field, amount)| match amount {
                            Value::Number(n) => Ok((field.clone(), n.clone())),
                            other => Err(NestDbError::InvalidUpdate(format!(
                                "$inc amount for '{field}' must be a number, got {}",
                                type_name(other)
                            ))),
                        })
                        .collect::<Result<_>>()?,
                ),
                "$push" => UpdateOp::Push(each_form(fields)),
                "$addToSet" => UpdateOp::AddToSet(each_form(fields)),
                "$pull" => UpdateOp::Pull(
                    fields
                        .iter()
                        .map(|(field, condition)| Ok((field.clone(), pull_condition(condition)?)))
                        .collect::<Result<_>>()?,
                ),
                other => {
                    return Err(NestDbError::InvalidUpdate(format!(
                        "unknown update operator '{other}'"
                    )))
                }
            });
        }
        Ok(Update { ops })
    }

    /// Whole-document `$set` from a document's own fields. Identity and
    /// timestamp fields are left to the store.
    pub fn replace_fields(doc: &Document) -> Update {
        let fields = doc
            .iter()
            .filter(|(k, _)| ![ID_FIELD, CREATED_AT, UPDATED_AT].contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Update {
            ops: vec![UpdateOp::Set(fields)],
        }
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Build the updated version of `original`. The original is never touched:
    /// either every operator applies and the new document is returned, or an
    /// error is returned.
    pub fn apply(&self, original: &Document) -> Result<Document> {
        let mut doc = original.clone();
        for op in &self.ops {
            apply_op(&mut doc, op)?;
        }
        Ok(doc)
    }
}

fn pairs(fields: &Map<String, Value>) -> Vec<(String, Value)> {
    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// `{"tags": "x"}` pushes one value, `{"tags": {"$each": ["x", "y"]}}` many.
fn each_form(fields: &Map<String, Value>) -> Vec<(String, Vec<Value>)> {
    fields
        .iter()
        .map(|(field, value)| {
            let items = match value.get("$each") {
                Some(Value::Array(items)) => items.clone(),
                Some(single) => vec![single.clone()],
                None => vec![value.clone()],
            };
            (field.clone(), items)
        })
        .collect()
}

fn pull_condition(condition: &Value) -> Result<PullCondition> {
    match condition {
        Value::Object(_) => Ok(PullCondition::Matches(Filter::parse_element(condition)?)),
        other => Ok(PullCondition::Literal(other.clone())),
    }
}

fn array_at(doc: &Document, field: &str, op: &str) -> Result<Vec<Value>> {
    match get_field(doc, field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(NestDbError::InvalidUpdate(format!(
            "{op}: field '{field}' is a {}, not an array",
            type_name(other)
        ))),
    }
}

fn apply_op(doc: &mut Document, op: &UpdateOp) -> Result<()> {
    match op {
        UpdateOp::Set(fields) => {
            for (field, value) in fields {
                set_field(doc, field, value.clone())?;
            }
        }
        UpdateOp::Unset(fields) => {
            for field in fields {
                remove_field(doc, field);
            }
        }
        UpdateOp::Inc(fields) => {
            for (field, amount) in fields {
                let current = match get_field(doc, field) {
                    None | Some(Value::Null) => Number::from(0),
                    Some(Value::Number(n)) => n.clone(),
                    Some(other) => {
                        return Err(NestDbError::InvalidUpdate(format!(
                            "$inc: field '{field}' is a {}, not a number",
                            type_name(other)
                        )))
                    }
                };
                set_field(doc, field, Value::Number(add_numbers(&current, amount)?))?;
            }
        }
        UpdateOp::Push(fields) => {
            for (field, items) in fields {
                let mut array = array_at(doc, field, "$push")?;
                array.extend(items.iter().cloned());
                set_field(doc, field, Value::Array(array))?;
            }
        }
        UpdateOp::AddToSet(fields) => {
            for (field, items) in fields {
                let mut array = array_at(doc, field, "$addToSet")?;
                for item in items {
                    if !array.iter().any(|existing| values_equal(existing, item)) {
                        array.push(item.clone());
                    }
                }
                set_field(doc, field, Value::Array(array))?;
            }
        }
        UpdateOp::Pull(fields) => {
            for (field, condition) in fields {
                if let Some(Value::Array(items)) = get_field(doc, field) {
                    let kept: Vec<Value> = items
                        .iter()
                        .filter(|item| !condition.removes(item))
                        .cloned()
                        .collect();
                    set_field(doc, field, Value::Array(kept))?;
                }
            }
        }
    }
    Ok(())
}

fn add_numbers(a: &Number, b: &Number) -> Result<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .ok_or_else(|| NestDbError::InvalidUpdate(format!("$inc produced a non-finite number ({sum})")))
}
