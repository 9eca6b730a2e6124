use crate::document::{is_object_id, Document};
use crate::error::{NestDbError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    #[serde(alias = "objectid")]
    ObjectId,
    Mixed,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::ObjectId => "object id",
            FieldType::Mixed => "mixed",
        }
    }

    /// Whether a present, non-null value has this type. Dates are RFC 3339
    /// timestamps or `YYYY-MM-DD` strings.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => value.as_str().map(is_date).unwrap_or(false),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::ObjectId => value.as_str().map(is_object_id).unwrap_or(false),
            FieldType::Mixed => true,
        }
    }
}

fn is_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;
pub type Generator = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub enum Required {
    #[default]
    No,
    Yes,
    /// Required only for documents the predicate accepts.
    When(Predicate),
}

impl Required {
    pub fn applies_to(&self, doc: &Document) -> bool {
        match self {
            Required::No => false,
            Required::Yes => true,
            Required::When(predicate) => predicate(doc),
        }
    }
}

#[derive(Clone)]
pub enum DefaultValue {
    Literal(Value),
    Generated(Generator),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Literal(value) => value.clone(),
            DefaultValue::Generated(generate) => generate(),
        }
    }
}

/// Declarative rule for one field. Built with chained setters:
///
/// ```
/// use nestdb::schema::FieldRule;
/// let email = FieldRule::string().required().trim().lowercase().unique();
/// let age = FieldRule::number().min(0.0).max(150.0);
/// ```
#[derive(Clone)]
pub struct FieldRule {
    pub field_type: FieldType,
    pub required: Required,
    pub default: Option<DefaultValue>,
    pub enum_values: Option<Vec<Value>>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub trim: bool,
    pub lowercase: bool,
    pub uppercase: bool,
    pub pattern: Option<Regex>,
    pub unique: bool,
    pub index: bool,
}

impl FieldRule {
    pub fn new(field_type: FieldType) -> Self {
        FieldRule {
            field_type,
            required: Required::No,
            default: None,
            enum_values: None,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            trim: false,
            lowercase: false,
            uppercase: false,
            pattern: None,
            unique: false,
            index: false,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn array() -> Self {
        Self::new(FieldType::Array)
    }

    pub fn object() -> Self {
        Self::new(FieldType::Object)
    }

    pub fn object_id() -> Self {
        Self::new(FieldType::ObjectId)
    }

    pub fn mixed() -> Self {
        Self::new(FieldType::Mixed)
    }

    pub fn required(mut self) -> Self {
        self.required = Required::Yes;
        self
    }

    pub fn required_when(mut self, predicate: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        self.required = Required::When(Arc::new(predicate));
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Literal(value.into()));
        self
    }

    pub fn default_with(mut self, generate: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Generated(Arc::new(generate)));
        self
    }

    pub fn enum_values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn min(mut self, n: f64) -> Self {
        self.min = Some(n);
        self
    }

    pub fn max(mut self, n: f64) -> Self {
        self.max = Some(n);
        self
    }

    pub fn trim(mut self) -> Self {
        self.trim = true;
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    pub fn uppercase(mut self) -> Self {
        self.uppercase = true;
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let required = match &self.required {
            Required::No => "no",
            Required::Yes => "yes",
            Required::When(_) => "conditional",
        };
        f.debug_struct("FieldRule")
            .field("field_type", &self.field_type)
            .field("required", &required)
            .field("has_default", &self.default.is_some())
            .field("enum_values", &self.enum_values)
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("unique", &self.unique)
            .field("index", &self.index)
            .finish()
    }
}

/// Definition of a single field in a schema file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub trim: bool,
    #[serde(default)]
    pub lowercase: bool,
    #[serde(default)]
    pub uppercase: bool,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

impl TryFrom<FieldDefinition> for FieldRule {
    type Error = NestDbError;

    fn try_from(def: FieldDefinition) -> Result<Self> {
        let pattern = def
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| NestDbError::Schema(format!("invalid pattern: {e}")))?;
        Ok(FieldRule {
            field_type: def.field_type,
            required: if def.required { Required::Yes } else { Required::No },
            default: def.default.map(DefaultValue::Literal),
            enum_values: def.enum_values,
            min_length: def.min_length,
            max_length: def.max_length,
            min: def.min,
            max: def.max,
            trim: def.trim,
            lowercase: def.lowercase,
            uppercase: def.uppercase,
            pattern,
            unique: def.unique,
            index: def.index,
        })
    }
}

/// A deferred index declaration. Multi-field specs become one index per
/// field; uniqueness only makes sense for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexSpec {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Top-level schema definition parsed from a schema file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}
