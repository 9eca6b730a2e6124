use crate::validation::ValidationErrors;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NestDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("Duplicate key in {collection}: {field} = {value}")]
    DuplicateKey {
        collection: String,
        field: String,
        value: String,
    },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Corrupt collection file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid collection name: '{0}'")]
    InvalidName(String),

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Persistence error for {collection}: {message}")]
    Persistence { collection: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ValidationErrors> for NestDbError {
    fn from(errors: ValidationErrors) -> Self {
        NestDbError::Validation(errors)
    }
}

pub type Result<T> = std::result::Result<T, NestDbError>;
