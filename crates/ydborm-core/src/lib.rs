//! Core types and traits for ydborm.
//!
//! This crate provides the foundations the query and session layers build on:
//!
//! - `Model` trait and column/relationship declarations
//! - `ModelRegistry` resolving model names to descriptors
//! - `Instance` handles with relationship slots and lazy proxies
//! - `Driver` trait for the database connection
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod error;
pub mod field;
pub mod instance;
pub mod model;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod types;
pub mod value;

pub use driver::{ConnectionConfig, Driver, PreparedStatement};
pub use error::{
    CompilationError, ConfigError, ConnectionError, ConnectionErrorKind, ConstraintError, Error,
    QueryError, QueryErrorKind, RelationshipError, RelationshipErrorKind, Result, ResultContext,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use field::FieldInfo;
pub use instance::{
    AnyInstance, Instance, LazyMany, LazyOne, Loaded, RelationLoader, SessionId, SlotState,
    WeakInstance,
};
pub use model::{Model, model_row, normalize_key, write_values};
pub use registry::{ModelDescriptor, ModelRegistry, RelationshipDescriptor};
pub use relationship::{
    RelationshipInfo, RelationshipKind, many_to_one, one_to_many, relationship,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use types::ColumnType;
pub use value::Value;
