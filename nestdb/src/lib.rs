pub mod aggregate;
pub mod document;
pub mod error;
pub mod index;
pub mod model;
pub mod query;
pub mod schema;
pub mod store;
pub mod update;
pub mod validation;
pub mod writer;

pub use document::Document;
pub use error::{NestDbError, Result};
pub use index::IndexOptions;
pub use model::{Model, ModelDocument};
pub use query::{Filter, FindOptions, Projection, SortSpec};
pub use schema::{FieldRule, FieldType, HookAction, IndexSpec, Schema, Virtual};
pub use store::{Collection, Store, StoreConfig, StoreStats, UpdateResult};
pub use update::Update;
pub use validation::ValidationErrors;
pub use writer::WriteFailure;
