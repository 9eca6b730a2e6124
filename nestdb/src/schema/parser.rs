use super::types::{FieldRule, SchemaDefinition};
use super::Schema;
use crate::error::Result;
use serde_json::Value;
use std::path::Path;

/// Parse a schema YAML file into a Schema
pub fn parse_schema(path: &Path) -> Result<Schema> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a Schema
pub fn parse_schema_str(content: &str) -> Result<Schema> {
    let definition: SchemaDefinition = serde_yaml::from_str(content)?;
    from_definition(definition)
}

/// Parse a schema given as JSON
pub fn parse_schema_value(value: &Value) -> Result<Schema> {
    let definition: SchemaDefinition = serde_json::from_value(value.clone())?;
    from_definition(definition)
}

fn from_definition(definition: SchemaDefinition) -> Result<Schema> {
    let mut schema = Schema::new();
    for (name, def) in definition.fields {
        schema = schema.field(name, FieldRule::try_from(def)?);
    }
    for spec in definition.indexes {
        schema = schema.index(spec);
    }
    Ok(schema)
}
