// Aggregation pipelines - single-key stages run left to right

use crate::document::{get_field, sort_order, values_equal, Document, ID_FIELD};
use crate::error::{NestDbError, Result};
use crate::query::{Filter, Projection, SortSpec};
use serde_json::{Number, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Sort(SortSpec),
    Limit(usize),
    Skip(usize),
    Project(Projection),
    Group(GroupSpec),
}

/// Either a `"$field"` reference or a literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(Value),
}

impl Operand {
    fn parse(value: &Value) -> Operand {
        match value.as_str().and_then(|s| s.strip_prefix('$')) {
            Some(path) => Operand::Field(path.to_string()),
            None => Operand::Literal(value.clone()),
        }
    }

    fn resolve<'a>(&'a self, doc: &'a Document) -> Option<&'a Value> {
        match self {
            Operand::Field(path) => get_field(doc, path),
            Operand::Literal(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Max,
    Min,
    First,
    Last,
}

impl AccumulatorOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$max" => AccumulatorOp::Max,
            "$min" => AccumulatorOp::Min,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key: Operand,
    pub accumulators: Vec<(String, AccumulatorOp, Operand)>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn parse(description: &Value) -> Result<Pipeline> {
        let stages = description.as_array().ok_or_else(|| {
            NestDbError::InvalidQuery("pipeline must be an array of stages".to_string())
        })?;
        let stages = stages.iter().map(parse_stage).collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The filter of a leading `$match`, which a collection can evaluate with
    /// its indexes before the pipeline runs.
    pub fn leading_match(&self) -> Option<&Filter> {
        match self.stages.first() {
            Some(Stage::Match(filter)) => Some(filter),
            _ => None,
        }
    }

    pub fn run(&self, mut docs: Vec<Document>) -> Vec<Document> {
        for stage in &self.stages {
            docs = match stage {
                Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
                Stage::Sort(sort) => {
                    sort.apply(&mut docs);
                    docs
                }
                Stage::Limit(n) => {
                    docs.truncate(*n);
                    docs
                }
                Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
                Stage::Project(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
                Stage::Group(spec) => group(spec, &docs),
            };
        }
        docs
    }
}

fn parse_stage(stage: &Value) -> Result<Stage> {
    let map = stage
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| {
            NestDbError::InvalidQuery(format!("stage must be an object with one key, got {stage}"))
        })?;
    let Some((name, body)) = map.iter().next() else {
        return Err(NestDbError::InvalidQuery("empty stage".to_string()));
    };
    Ok(match name.as_str() {
        "$match" => Stage::Match(Filter::parse(body)?),
        "$sort" => Stage::Sort(SortSpec::parse(body)?),
        "$limit" => Stage::Limit(count(name, body)?),
        "$skip" => Stage::Skip(count(name, body)?),
        "$project" => Stage::Project(Projection::parse(body)?),
        "$group" => Stage::Group(parse_group(body)?),
        other => {
            return Err(NestDbError::InvalidQuery(format!(
                "unknown pipeline stage '{other}'"
            )))
        }
    })
}

fn count(stage: &str, body: &Value) -> Result<usize> {
    body.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| NestDbError::InvalidQuery(format!("{stage} expects a non-negative integer")))
}

fn parse_group(body: &Value) -> Result<GroupSpec> {
    let map = body
        .as_object()
        .ok_or_else(|| NestDbError::InvalidQuery("$group expects an object".to_string()))?;
    let key = map
        .get(ID_FIELD)
        .map(Operand::parse)
        .ok_or_else(|| NestDbError::InvalidQuery("$group requires an _id".to_string()))?;

    let mut accumulators = Vec::new();
    for (field, spec) in map.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
        let (op, operand) = spec
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| {
                NestDbError::InvalidQuery(format!(
                    "$group field '{field}' must be a single accumulator"
                ))
            })?;
        let op = AccumulatorOp::from_name(op).ok_or_else(|| {
            NestDbError::InvalidQuery(format!("unknown accumulator '{op}' for '{field}'"))
        })?;
        accumulators.push((field.clone(), op, Operand::parse(operand)));
    }
    Ok(GroupSpec { key, accumulators })
}

/// Running numeric total; stays integral until a float shows up.
#[derive(Debug, Clone, Copy)]
enum Total {
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, n: &Number) -> Total {
        match (self, n.as_i64()) {
            (Total::Int(a), Some(b)) => match a.checked_add(b) {
                Some(sum) => Total::Int(sum),
                None => Total::Float(a as f64 + b as f64),
            },
            (total, _) => Total::Float(total.as_f64() + n.as_f64().unwrap_or(0.0)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Total::Int(i) => i as f64,
            Total::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Total::Int(i) => Value::from(i),
            Total::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug)]
enum State {
    Sum(Total),
    Avg(Total, usize),
    Extreme(Option<Value>),
    First(Option<Value>),
    Last(Value),
}

impl State {
    fn new(op: AccumulatorOp) -> State {
        match op {
            AccumulatorOp::Sum => State::Sum(Total::Int(0)),
            AccumulatorOp::Avg => State::Avg(Total::Int(0), 0),
            AccumulatorOp::Max | AccumulatorOp::Min => State::Extreme(None),
            AccumulatorOp::First => State::First(None),
            AccumulatorOp::Last => State::Last(Value::Null),
        }
    }

    fn feed(&mut self, op: AccumulatorOp, value: Option<&Value>) {
        match self {
            State::Sum(total) => {
                if let Some(Value::Number(n)) = value {
                    *total = total.add(n);
                }
            }
            State::Avg(total, seen) => {
                if let Some(Value::Number(n)) = value {
                    *total = total.add(n);
                    *seen += 1;
                }
            }
            State::Extreme(best) => {
                let Some(candidate) = value.filter(|v| !v.is_null()) else {
                    return;
                };
                let wanted = if op == AccumulatorOp::Max {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                let replace = match best {
                    None => true,
                    Some(current) => sort_order(Some(candidate), Some(current)) == wanted,
                };
                if replace {
                    *best = Some(candidate.clone());
                }
            }
            State::First(first) => {
                if first.is_none() {
                    *first = Some(value.cloned().unwrap_or(Value::Null));
                }
            }
            State::Last(last) => *last = value.cloned().unwrap_or(Value::Null),
        }
    }

    fn finish(self) -> Value {
        match self {
            State::Sum(total) => total.into_value(),
            State::Avg(_, 0) => Value::Null,
            State::Avg(total, seen) => Number::from_f64(total.as_f64() / seen as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            State::Extreme(best) => best.unwrap_or(Value::Null),
            State::First(first) => first.unwrap_or(Value::Null),
            State::Last(last) => last,
        }
    }
}

/// Groups come out in the order their key was first seen.
fn group(spec: &GroupSpec, docs: &[Document]) -> Vec<Document> {
    let mut groups: Vec<(Value, Vec<State>)> = Vec::new();
    for doc in docs {
        let key = spec.key.resolve(doc).cloned().unwrap_or(Value::Null);
        let slot = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(slot) => slot,
            None => {
                let states = spec.accumulators.iter().map(|(_, op, _)| State::new(*op)).collect();
                groups.push((key, states));
                groups.len() - 1
            }
        };
        for ((_, op, operand), state) in spec.accumulators.iter().zip(groups[slot].1.iter_mut()) {
            state.feed(*op, operand.resolve(doc));
        }
    }

    groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::new();
            out.insert(ID_FIELD.to_string(), key);
            for ((field, _, _), state) in spec.accumulators.iter().zip(states) {
                out.insert(field.clone(), state.finish());
            }
            out
        })
        .collect()
}
