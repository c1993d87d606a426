//! The immutable, chainable query builder.

use crate::compile::{
    BoundPredicate, CompiledStatement, SelectSpec, TableRef, compile_count, compile_select,
    parse_order_spec,
};
use crate::predicate::Predicate;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use ydborm_core::{
    Cx, Error, Instance, Model, Outcome, RelationshipErrorKind, Result, ResultContext, Row, Value,
};

/// Runs compiled statements for terminal query operations.
///
/// Implemented by the session, which owns the driver, the statement cache
/// and the identity map.
pub trait QueryExecutor {
    /// Execute a SELECT and hydrate each row as the canonical instance of
    /// `M`, then load `includes` eagerly.
    fn fetch_instances<M: Model>(
        &mut self,
        cx: &Cx,
        statement: CompiledStatement,
        includes: &[&'static str],
    ) -> impl Future<Output = Outcome<Vec<Instance<M>>, Error>> + Send;

    /// Execute a statement and return its raw rows.
    fn fetch_rows(
        &mut self,
        cx: &Cx,
        statement: CompiledStatement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;
}

/// Query over model `M`.
///
/// Every chain method borrows `self` and returns a new query, so a base query
/// can be reused freely:
///
/// ```ignore
/// let adults = session.query::<User>().filter(gt("age", 18))?;
/// let named = adults.filter_by_field("name", "Alice")?;
/// let total = adults.count(&cx, &mut session).await;
/// ```
pub struct Query<M: Model> {
    spec: SelectSpec,
    includes: Vec<&'static str>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for Query<M> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            includes: self.includes.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for Query<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("model", &M::MODEL_NAME)
            .field("where", &self.spec.predicate_shape())
            .field("order", &self.spec.order)
            .field("limit", &self.spec.limit)
            .field("offset", &self.spec.offset)
            .field("distinct", &self.spec.distinct)
            .field("includes", &self.includes)
            .finish()
    }
}

impl<M: Model> Default for Query<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Query<M> {
    pub fn new() -> Self {
        Self {
            spec: SelectSpec::new(TableRef::of::<M>()),
            includes: Vec::new(),
            _model: PhantomData,
        }
    }

    fn table(&self) -> &TableRef {
        &self.spec.table
    }

    /// Add a predicate, AND-ed with the existing ones.
    #[allow(clippy::result_large_err)]
    pub fn filter(&self, predicate: Predicate) -> Result<Self> {
        let bound = BoundPredicate::bind(self.table(), predicate)?;
        let mut next = self.clone();
        next.spec.predicates.push(bound);
        Ok(next)
    }

    /// Add one equality predicate per `(field, value)` pair.
    #[allow(clippy::result_large_err)]
    pub fn filter_by<I, V>(&self, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        let mut next = self.clone();
        for (field, value) in pairs {
            let bound = BoundPredicate::bind(self.table(), crate::predicate::eq(field, value))?;
            next.spec.predicates.push(bound);
        }
        Ok(next)
    }

    /// Equality filter on a single field.
    #[allow(clippy::result_large_err)]
    pub fn filter_by_field(&self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.filter(crate::predicate::eq(field, value))
    }

    /// Restrict the selected columns.
    ///
    /// Instances can only be hydrated when every model column is selected;
    /// use [`rows`](Self::rows) for partial projections.
    #[allow(clippy::result_large_err)]
    pub fn select(&self, fields: &[&str]) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::compilation(
                M::MODEL_NAME,
                None,
                "select requires at least one field",
            ));
        }
        let mut columns: Vec<&'static str> = Vec::with_capacity(fields.len());
        for name in fields {
            let info = self
                .table()
                .field(name)
                .ok_or_else(|| Error::compilation(M::MODEL_NAME, Some(*name), "unknown field"))?;
            if !columns.contains(&info.name) {
                columns.push(info.name);
            }
        }
        let mut next = self.clone();
        next.spec.projection = Some(columns);
        Ok(next)
    }

    pub fn distinct(&self) -> Self {
        let mut next = self.clone();
        next.spec.distinct = true;
        next
    }

    /// Append orderings. Each spec is `"field"` or `"field ASC|DESC"`.
    #[allow(clippy::result_large_err)]
    pub fn order_by(&self, specs: &[&str]) -> Result<Self> {
        let mut next = self.clone();
        for spec in specs {
            next.spec.order.push(parse_order_spec(self.table(), spec)?);
        }
        Ok(next)
    }

    pub fn limit(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.spec.limit = Some(n);
        next
    }

    pub fn offset(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.spec.offset = Some(n);
        next
    }

    /// Load `relationship` eagerly with one batched query.
    #[allow(clippy::result_large_err)]
    pub fn include(&self, relationship: &str) -> Result<Self> {
        let info = M::relationship_info(relationship).ok_or_else(|| {
            Error::relationship(
                RelationshipErrorKind::UnknownRelationship,
                M::MODEL_NAME,
                relationship,
                "no such relationship",
            )
        })?;
        let mut next = self.clone();
        if !next.includes.contains(&info.name) {
            next.includes.push(info.name);
        }
        Ok(next)
    }

    pub fn spec(&self) -> &SelectSpec {
        &self.spec
    }

    pub fn includes(&self) -> &[&'static str] {
        &self.includes
    }

    /// Compile the SELECT this query would run for [`all`](Self::all).
    pub fn compile(&self) -> CompiledStatement {
        compile_select(&self.spec)
    }

    pub fn compile_count(&self) -> CompiledStatement {
        compile_count(&self.spec)
    }

    fn with_limit_at_most(&self, cap: u64) -> SelectSpec {
        let mut spec = self.spec.clone();
        spec.limit = Some(spec.limit.map_or(cap, |n| n.min(cap)));
        spec
    }

    fn result_context(&self) -> ResultContext {
        ResultContext {
            model: M::MODEL_NAME,
            predicate: self.spec.predicate_shape(),
        }
    }

    #[allow(clippy::result_large_err)]
    fn require_full_projection(&self) -> Result<()> {
        if self.spec.selects_all_columns() {
            Ok(())
        } else {
            Err(Error::compilation(
                M::MODEL_NAME,
                None,
                "partial projection cannot hydrate instances; use rows()",
            ))
        }
    }

    /// All matching instances.
    #[tracing::instrument(level = "debug", skip(self, cx, exec), fields(model = M::MODEL_NAME))]
    pub async fn all<E: QueryExecutor>(
        &self,
        cx: &Cx,
        exec: &mut E,
    ) -> Outcome<Vec<Instance<M>>, Error> {
        if let Err(e) = self.require_full_projection() {
            return Outcome::Err(e);
        }
        exec.fetch_instances::<M>(cx, compile_select(&self.spec), &self.includes)
            .await
    }

    /// First matching instance, if any. Never raises a smaller explicit limit.
    #[tracing::instrument(level = "debug", skip(self, cx, exec), fields(model = M::MODEL_NAME))]
    pub async fn first<E: QueryExecutor>(
        &self,
        cx: &Cx,
        exec: &mut E,
    ) -> Outcome<Option<Instance<M>>, Error> {
        if let Err(e) = self.require_full_projection() {
            return Outcome::Err(e);
        }
        let spec = self.with_limit_at_most(1);
        exec.fetch_instances::<M>(cx, compile_select(&spec), &self.includes)
            .await
            .map(|rows| rows.into_iter().next())
    }

    /// Exactly one matching instance.
    ///
    /// Fails with `NoResultFound` or `MultipleResultsFound`, both carrying the
    /// model name and predicate shape.
    #[tracing::instrument(level = "debug", skip(self, cx, exec), fields(model = M::MODEL_NAME))]
    pub async fn one<E: QueryExecutor>(&self, cx: &Cx, exec: &mut E) -> Outcome<Instance<M>, Error> {
        match self.one_or_none(cx, exec).await {
            Outcome::Ok(Some(instance)) => Outcome::Ok(instance),
            Outcome::Ok(None) => Outcome::Err(Error::NoResultFound(self.result_context())),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// At most one matching instance; more than one is `MultipleResultsFound`.
    pub async fn one_or_none<E: QueryExecutor>(
        &self,
        cx: &Cx,
        exec: &mut E,
    ) -> Outcome<Option<Instance<M>>, Error> {
        if let Err(e) = self.require_full_projection() {
            return Outcome::Err(e);
        }
        let spec = self.with_limit_at_most(2);
        let found = match exec
            .fetch_instances::<M>(cx, compile_select(&spec), &self.includes)
            .await
        {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if found.len() > 1 {
            return Outcome::Err(Error::MultipleResultsFound(self.result_context()));
        }
        Outcome::Ok(found.into_iter().next())
    }

    /// Number of matching rows.
    #[tracing::instrument(level = "debug", skip(self, cx, exec), fields(model = M::MODEL_NAME))]
    pub async fn count<E: QueryExecutor>(&self, cx: &Cx, exec: &mut E) -> Outcome<u64, Error> {
        exec.fetch_rows(cx, compile_count(&self.spec))
            .await
            .and_then(|rows| match rows.first() {
                Some(row) => match row.get_named::<u64>("count") {
                    Ok(count) => Outcome::Ok(count),
                    Err(e) => Outcome::Err(e),
                },
                None => Outcome::Ok(0),
            })
    }

    /// Whether any row matches.
    pub async fn exists<E: QueryExecutor>(&self, cx: &Cx, exec: &mut E) -> Outcome<bool, Error> {
        self.count(cx, exec).await.map(|n| n > 0)
    }

    /// Raw rows, for partial projections.
    pub async fn rows<E: QueryExecutor>(&self, cx: &Cx, exec: &mut E) -> Outcome<Vec<Row>, Error> {
        exec.fetch_rows(cx, compile_select(&self.spec)).await
    }
}
