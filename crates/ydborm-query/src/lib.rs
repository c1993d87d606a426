//! Query construction layer for ydborm.
//!
//! `ydborm-query` turns `Model` metadata into compiled statements plus
//! parameters, and caches the prepared form of each statement shape.
//!
//! # Role In The Architecture
//!
//! - **Predicates**: `eq`, `gt`, `in_`, `like`, `between` and the `col` proxy.
//! - **Query**: an immutable builder whose terminal operations run through a
//!   [`QueryExecutor`], normally the session.
//! - **Compiler**: renders parameterized YQL with `DECLARE`d parameters.
//! - **Statement cache**: a shared LRU of prepared statements keyed by shape.
//!
//! Most users access these types via the `ydborm` facade crate.

pub mod cache;
pub mod compile;
pub mod predicate;
pub mod query;

pub use cache::{CacheStats, DEFAULT_CAPACITY, StatementCache};
pub use compile::{
    BoundPredicate, CompiledStatement, Direction, OrderBy, SelectSpec, StatementKind,
    StatementShape, TableRef, compile_count, compile_delete, compile_select, compile_write,
    parse_order_spec,
};
pub use predicate::{
    Column, Operand, Operator, Predicate, between, col, eq, ge, gt, in_, le, like, lt, ne,
};
pub use query::{Query, QueryExecutor};

/// Create a query for a model.
///
/// # Example
///
/// ```ignore
/// let adults = select!(User)
///     .filter(gt("age", 18))?
///     .order_by(&["name"])?
///     .all(&cx, &mut session)
///     .await;
/// ```
#[macro_export]
macro_rules! select {
    ($model:ty) => {
        $crate::Query::<$model>::new()
    };
}
