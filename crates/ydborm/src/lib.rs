//! ydborm - a session-based ORM for YDB.
//!
//! ydborm maps plain Rust structs to YDB tables and provides:
//!
//! - An immutable, chainable query builder compiled to parameterized YQL
//! - A prepared statement cache keyed by query shape, shared across sessions
//! - A per-session identity map: one in-memory instance per primary key
//! - Buffered writes with nested transaction scopes
//! - Declared relationships, loaded lazily or eagerly with `include`
//!
//! # Quick Start
//!
//! ```ignore
//! use ydborm::prelude::*;
//!
//! #[derive(Debug, Clone)]
//! struct Hero {
//!     id: i64,
//!     name: String,
//!     team_id: Option<i64>,
//! }
//!
//! impl Model for Hero {
//!     const MODEL_NAME: &'static str = "Hero";
//!     const TABLE_NAME: &'static str = "heroes";
//!     const PRIMARY_KEY: &'static [&'static str] = &["id"];
//!     const RELATIONSHIPS: &'static [RelationshipInfo] =
//!         &[many_to_one("team", "Team", "team_id").backref("heroes")];
//!     // fields, to_row, from_row, primary_key_value ...
//! }
//!
//! async fn example(cx: &Cx, config: &ConnectionConfig) -> Outcome<(), Error> {
//!     let mut session = Session::<MemoryDriver>::connect(cx, config).await?;
//!
//!     // Autocommit insert
//!     let hero = session.add(cx, &Instance::new(hero)).await?;
//!
//!     // Query; the same row always yields the same instance
//!     let heroes = select!(Hero)
//!         .filter(gt("id", 0))?
//!         .order_by(&["name"])?
//!         .include("team")?
//!         .all(cx, &mut session)
//!         .await?;
//!
//!     // Buffered writes, committed atomically
//!     session
//!         .transaction(cx, async |s| {
//!             hero.write().name = "Spider-Boy".to_string();
//!             s.upsert(cx, &hero).await?;
//!             s.delete(cx, &heroes[1]).await
//!         })
//!         .await?;
//!
//!     session.close(cx).await
//! }
//! ```
//!
//! # Crates
//!
//! - `ydborm-core`: values, models, the registry, instance handles, the
//!   `Driver` trait and the error taxonomy
//! - `ydborm-query`: predicates, `Query`, statement compilation and the
//!   statement cache
//! - `ydborm-session`: `Session`, identity map, unit of work, relationship
//!   loading
//! - `ydborm-memory`: an in-process `Driver` for tests and local runs

// Re-export all public types from sub-crates
pub use ydborm_core::{
    // Instances and relationships
    AnyInstance,
    // asupersync re-exports
    Budget,
    // Errors
    CompilationError,
    ConfigError,
    // Driver interface
    ConnectionConfig,
    ConnectionError,
    ConnectionErrorKind,
    ConstraintError,
    Cx,
    Driver,
    Error,
    // Model declaration
    ColumnType,
    FieldInfo,
    FromValue,
    Instance,
    LazyMany,
    LazyOne,
    Loaded,
    Model,
    ModelDescriptor,
    ModelRegistry,
    Outcome,
    PreparedStatement,
    QueryError,
    QueryErrorKind,
    RegionId,
    RelationLoader,
    RelationshipError,
    RelationshipErrorKind,
    RelationshipInfo,
    RelationshipKind,
    Result,
    ResultContext,
    Row,
    SessionId,
    TaskId,
    TransactionError,
    TransactionErrorKind,
    TypeError,
    Value,
    many_to_one,
    one_to_many,
    relationship,
};

pub use ydborm_query::{
    CacheStats, Column, CompiledStatement, DEFAULT_CAPACITY, Direction, Operand, Operator, OrderBy,
    Predicate, Query, QueryExecutor, StatementCache, StatementKind, StatementShape, between, col,
    eq, ge, gt, in_, le, like, lt, ne, select,
};

pub use ydborm_session::{Session, SessionConfig, SessionDebugInfo, SessionStats};

pub use ydborm_memory::MemoryDriver;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ydborm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ColumnType, Column, ConnectionConfig, Cx, Error, FieldInfo, Instance, MemoryDriver, Model,
        Outcome, Predicate, Query, RelationshipInfo, Result, Row, Session, SessionConfig, Value,
        between, col, eq, ge, gt, in_, le, like, lt, many_to_one, ne, one_to_many, select,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[derive(Debug, Clone)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Model for Note {
        const MODEL_NAME: &'static str = "Note";
        const TABLE_NAME: &'static str = "notes";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", ColumnType::Int64).primary_key(true),
                FieldInfo::new("body", ColumnType::Utf8),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("body", self.body.clone().into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                body: row.get_named("body")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.id.into()]
        }
    }

    #[test]
    fn test_select_macro_through_facade() {
        let query = select!(Note)
            .filter(like("body", "a%"))
            .unwrap()
            .order_by(&["id desc"])
            .unwrap()
            .limit(5);
        let compiled = query.compile();
        assert!(
            compiled
                .text
                .ends_with("SELECT `id`, `body` FROM `notes` WHERE `body` LIKE $p1 ORDER BY `id` DESC LIMIT $p2;")
        );
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_prelude_predicates_compose() {
        let query = select!(Note)
            .filter(between("id", 1_i64, 10_i64))
            .unwrap()
            .filter(ne("body", ""))
            .unwrap();
        assert_eq!(query.spec().predicates.len(), 2);
    }
}
