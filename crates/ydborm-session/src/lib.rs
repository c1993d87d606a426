//! Session and Unit of Work for ydborm.
//!
//! `ydborm-session` is the **unit-of-work layer**. It coordinates object
//! identity, buffered writes and transaction scopes over a [`Driver`], and
//! resolves declared relationships.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per primary key.
//! - **Unit of work**: writes buffer inside a scope and run at flush/commit.
//! - **Transactional safety**: nested scopes share the outermost driver
//!   transaction; a rollback anywhere aborts the whole stack.
//! - **Relationships**: lazy proxies and eager `include` loading.
//!
//! # Design Philosophy
//!
//! - **Exclusive access**: every operation takes `&mut self`.
//! - **Shared statements**: the prepared statement cache is an
//!   `Arc<StatementCache>` that sessions may share.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`; an
//!   interrupted driver call inside a scope rolls the scope back.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::<MemoryDriver>::connect(&cx, &config).await?;
//!
//! // Autocommit: runs immediately
//! let hero = session.add(&cx, &Instance::new(hero)).await?;
//!
//! // Buffered until commit
//! session.transaction(&cx, async |s| {
//!     s.upsert(&cx, &hero).await?;
//!     s.delete(&cx, &villain).await
//! }).await?;
//!
//! session.close(&cx).await?;
//! ```

pub mod identity_map;
pub mod loader;
pub mod unit_of_work;

pub use identity_map::{IdentityKey, IdentityMap};
pub use unit_of_work::{JournalEntry, PendingWrite, UnitOfWork, WriteKind};

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use ydborm_core::{
    AnyInstance, ConfigError, ConnectionConfig, ConnectionError, ConnectionErrorKind,
    ConstraintError, Driver, Error, Instance, Model, ModelDescriptor, ModelRegistry, QueryErrorKind,
    Result, Row, SessionId, TypeError, Value, normalize_key,
};
use ydborm_query::{
    CompiledStatement, DEFAULT_CAPACITY, Query, QueryExecutor, StatementCache, TableRef,
    compile_delete, compile_write,
};

// ============================================================================
// Session Configuration
// ============================================================================

fn default_auto_flush() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_wait_ready_ms() -> u64 {
    10_000
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Whether queries flush buffered writes first, so a scope observes its
    /// own writes.
    #[serde(default = "default_auto_flush")]
    pub auto_flush: bool,
    /// Capacity of the statement cache created by `Session::with_config`.
    #[serde(default = "default_cache_capacity")]
    pub statement_cache_capacity: usize,
    /// How long `Session::connect` waits for the endpoint.
    #[serde(default = "default_wait_ready_ms")]
    pub wait_ready_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: default_auto_flush(),
            statement_cache_capacity: default_cache_capacity(),
            wait_ready_timeout_ms: default_wait_ready_ms(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn wait_ready_timeout(mut self, ms: u64) -> Self {
        self.wait_ready_timeout_ms = ms;
        self
    }

    /// Parse settings from JSON. Missing fields take their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.statement_cache_capacity == 0 {
            return Err(Error::Config(ConfigError {
                message: "statement_cache_capacity must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(config)
    }
}

/// Counters kept by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Statements sent to the driver
    pub statements_executed: u64,
    /// Statements prepared because the cache missed
    pub statements_prepared: u64,
    pub cache_hits: u64,
    pub lazy_loads: u64,
    pub eager_loads: u64,
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    pub id: SessionId,
    /// Instances in the identity map.
    pub tracked: usize,
    /// Writes buffered in the open scope.
    pub pending_writes: usize,
    pub scope_depth: usize,
    pub aborted: bool,
    /// Whether a driver transaction is open.
    pub in_transaction: bool,
    pub stats: SessionStats,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns the driver, keeps one canonical instance per primary key and
/// coordinates buffered writes with transaction scopes.
pub struct Session<D: Driver> {
    id: SessionId,
    /// `None` only while `close` hands the driver back.
    driver: Option<D>,
    config: SessionConfig,
    registry: &'static ModelRegistry,
    cache: Arc<StatementCache>,
    identity: IdentityMap,
    work: UnitOfWork,
    stats: SessionStats,
}

fn closed_error() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: "session is closed".to_string(),
        source: None,
    })
}

#[allow(clippy::result_large_err)]
fn downcast_instance<M: Model>(instance: &AnyInstance) -> Result<Instance<M>> {
    instance.downcast::<M>().ok_or_else(|| {
        Error::Type(TypeError {
            expected: M::MODEL_NAME,
            actual: instance.model_name().to_string(),
            column: None,
        })
    })
}

impl<D: Driver> Session<D> {
    /// Create a new session over an open driver.
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(driver: D, config: SessionConfig) -> Self {
        let cache = Arc::new(StatementCache::new(config.statement_cache_capacity));
        let id = SessionId::next();
        tracing::debug!(session = %id, auto_flush = config.auto_flush, "Opened session");
        Self {
            id,
            driver: Some(driver),
            config,
            registry: ModelRegistry::global(),
            cache,
            identity: IdentityMap::new(),
            work: UnitOfWork::new(),
            stats: SessionStats::default(),
        }
    }

    /// Use a statement cache shared with other sessions.
    #[must_use]
    pub fn with_statement_cache(mut self, cache: Arc<StatementCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Resolve models through `registry` instead of the global one.
    #[must_use]
    pub fn with_registry(mut self, registry: &'static ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Open a driver and wait until the endpoint is ready.
    pub async fn connect(cx: &Cx, config: &ConnectionConfig) -> Outcome<Self, Error> {
        let session_config =
            SessionConfig::default().wait_ready_timeout(config.wait_ready_timeout_ms);
        Self::connect_with_config(cx, config, session_config).await
    }

    #[tracing::instrument(level = "debug", skip(cx, connection, config), fields(endpoint = %connection.endpoint))]
    pub async fn connect_with_config(
        cx: &Cx,
        connection: &ConnectionConfig,
        config: SessionConfig,
    ) -> Outcome<Self, Error> {
        let driver = match D::open(cx, connection).await {
            Outcome::Ok(driver) => driver,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let timeout = Duration::from_millis(config.wait_ready_timeout_ms);
        match driver.wait_ready(cx, timeout).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                if let Err(close_err) = driver.close(cx).await {
                    tracing::debug!(error = %close_err, "Closing unready driver failed");
                }
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(Self::with_config(driver, config))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }

    pub fn registry(&self) -> &'static ModelRegistry {
        self.registry
    }

    pub fn statement_cache(&self) -> &Arc<StatementCache> {
        &self.cache
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Register `M` with the session's registry.
    #[allow(clippy::result_large_err)]
    pub fn register<M: Model>(&self) -> Result<Arc<ModelDescriptor>> {
        self.registry.register::<M>()
    }

    /// Start a query over `M`.
    pub fn query<M: Model>(&self) -> Query<M> {
        Query::new()
    }

    // ========================================================================
    // Statement Execution
    // ========================================================================

    async fn run_statement(&mut self, cx: &Cx, compiled: &CompiledStatement) -> Outcome<Vec<Row>, Error> {
        let outcome = self.run_statement_inner(cx, compiled).await;
        if matches!(outcome, Outcome::Cancelled(_) | Outcome::Panicked(_)) && self.work.in_scope() {
            tracing::debug!(
                session = %self.id,
                table = compiled.shape.table,
                "Driver call interrupted inside a scope, rolling back"
            );
            self.abort_scope(cx).await;
        }
        outcome
    }

    async fn run_statement_inner(
        &mut self,
        cx: &Cx,
        compiled: &CompiledStatement,
    ) -> Outcome<Vec<Row>, Error> {
        let Some(driver) = self.driver.as_ref() else {
            return Outcome::Err(closed_error());
        };
        let (statement, hit) = match self.cache.get_or_prepare(cx, driver, compiled).await {
            Outcome::Ok(prepared) => prepared,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if hit {
            self.stats.cache_hits += 1;
        } else {
            self.stats.statements_prepared += 1;
        }
        self.stats.statements_executed += 1;
        tracing::debug!(
            session = %self.id,
            table = compiled.shape.table,
            kind = ?compiled.shape.kind,
            cache_hit = hit,
            "Executing statement"
        );
        driver.execute(cx, &statement, &compiled.params).await
    }

    async fn auto_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.config.auto_flush && self.work.has_pending() {
            self.flush(cx).await
        } else {
            Outcome::Ok(())
        }
    }

    // ========================================================================
    // Identity Map & Hydration
    // ========================================================================

    fn attach(&mut self, model: &'static str, key: Vec<Value>, instance: &AnyInstance) {
        instance.set_owner(Some(self.id));
        self.identity.insert(model, key.clone(), instance.clone());
        self.work.record(JournalEntry::Attached { model, key });
    }

    /// Map a row of `descriptor`'s table to its canonical instance.
    ///
    /// A known key refreshes the existing instance in place; an unknown key
    /// attaches a newly decoded one.
    #[allow(clippy::result_large_err)]
    pub(crate) fn hydrate_any(&mut self, descriptor: &ModelDescriptor, row: &Row) -> Result<AnyInstance> {
        let raw = descriptor
            .primary_key
            .iter()
            .map(|column| row.get_by_name(column).cloned().unwrap_or(Value::Null))
            .collect();
        let key = descriptor.normalize_key(raw)?;
        if let Some(existing) = self.identity.get(descriptor.name, &key) {
            self.journal_refresh(&existing);
            existing.refresh_from(row)?;
            tracing::trace!(model = descriptor.name, key = ?key, "Refreshed canonical instance");
            return Ok(existing);
        }
        let instance = descriptor.decode(row)?;
        self.attach(descriptor.name, key, &instance);
        Ok(instance)
    }

    /// Map a row to the canonical `Instance<M>`.
    #[allow(clippy::result_large_err)]
    pub fn hydrate<M: Model>(&mut self, row: &Row) -> Result<Instance<M>> {
        let descriptor = self.registry.register::<M>()?;
        let instance = self.hydrate_any(&descriptor, row)?;
        downcast_instance::<M>(&instance)
    }

    /// Look up by primary key, querying only on an identity map miss.
    pub async fn get<M: Model>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<Option<Instance<M>>, Error> {
        self.get_by_key::<M>(cx, vec![pk.into()]).await
    }

    /// Like [`get`](Self::get) for composite keys, given in key column order.
    #[tracing::instrument(level = "debug", skip(self, cx, key), fields(model = M::MODEL_NAME))]
    pub async fn get_by_key<M: Model>(
        &mut self,
        cx: &Cx,
        key: Vec<Value>,
    ) -> Outcome<Option<Instance<M>>, Error> {
        let key = match normalize_key(M::MODEL_NAME, M::fields(), M::PRIMARY_KEY, key) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(found) = self.identity.get_typed::<M>(&key) {
            tracing::trace!(key = ?key, "Identity map hit");
            return Outcome::Ok(Some(found));
        }
        let query = match Query::<M>::new().filter_by(M::PRIMARY_KEY.iter().copied().zip(key)) {
            Ok(query) => query,
            Err(e) => return Outcome::Err(e),
        };
        query.first(cx, self).await
    }

    /// Canonical instance for `key`, without I/O.
    pub fn get_from_identity_map<M: Model>(&self, key: Vec<Value>) -> Option<Instance<M>> {
        let key = normalize_key(M::MODEL_NAME, M::fields(), M::PRIMARY_KEY, key).ok()?;
        self.identity.get_typed::<M>(&key)
    }

    /// Whether `instance` is the canonical instance for its key.
    pub fn contains<M: Model>(&self, instance: &Instance<M>) -> bool {
        let erased = instance.erase();
        erased.identity_key().is_ok_and(|key| {
            self.identity
                .contains_instance(M::MODEL_NAME, &key, &erased)
        })
    }

    /// Remove `instance` from the identity map and detach it.
    pub fn expunge<M: Model>(&mut self, instance: &Instance<M>) -> bool {
        let erased = instance.erase();
        let Ok(key) = erased.identity_key() else {
            return false;
        };
        if self
            .identity
            .remove_instance(M::MODEL_NAME, &key, &erased)
        {
            erased.set_owner(None);
            true
        } else {
            false
        }
    }

    /// Detach every instance.
    pub fn expunge_all(&mut self) {
        self.detach_all();
    }

    fn detach_all(&mut self) {
        for instance in self.identity.drain() {
            instance.set_owner(None);
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn prepare_write<M: Model>(&self, instance: &Instance<M>, kind: WriteKind) -> Result<PendingWrite> {
        self.registry.register::<M>()?;
        let table = TableRef::of::<M>();
        let erased = instance.erase();
        let key = erased.identity_key()?;
        let statement = match kind {
            WriteKind::Insert => compile_write(&table, &erased.row(), false)?,
            WriteKind::Upsert => compile_write(&table, &erased.row(), true)?,
            WriteKind::Delete => compile_delete(&table, key.clone())?,
        };
        Ok(PendingWrite {
            kind,
            model: M::MODEL_NAME,
            key,
            statement,
            instance: erased,
        })
    }

    /// Make `instance` canonical for `key`, or refresh the existing canonical
    /// instance with its values.
    #[allow(clippy::result_large_err)]
    fn canonicalize<M: Model>(&mut self, instance: &Instance<M>, key: &[Value]) -> Result<Instance<M>> {
        if let Some(existing) = self.identity.get(M::MODEL_NAME, key) {
            let existing = downcast_instance::<M>(&existing)?;
            if !existing.ptr_eq(instance) {
                self.journal_refresh(&existing.erase());
                *existing.write() = instance.snapshot();
                tracing::debug!(model = M::MODEL_NAME, key = ?key, "Refreshed canonical instance from write");
            }
            return Ok(existing);
        }
        let canonical = match instance.owner() {
            Some(owner) if owner != self.id => Instance::new(instance.snapshot()),
            _ => instance.clone(),
        };
        self.attach(M::MODEL_NAME, key.to_vec(), &canonical.erase());
        Ok(canonical)
    }

    /// Remember `instance`'s current values so a rollback can restore them.
    fn journal_refresh(&mut self, instance: &AnyInstance) {
        if self.work.in_scope() {
            self.work.record(JournalEntry::Refreshed {
                instance: instance.clone(),
                previous: instance.row(),
            });
        }
    }

    /// Remove a deleted row's canonical instance and detach it.
    fn forget(&mut self, model: &'static str, key: &[Value], instance: &AnyInstance) {
        if let Some(canonical) = self.identity.remove(model, key) {
            canonical.set_owner(None);
            self.work.record(JournalEntry::Removed {
                model,
                key: key.to_vec(),
                instance: canonical,
            });
        }
        if instance.owner() == Some(self.id) {
            instance.set_owner(None);
        }
    }

    async fn execute_write(&mut self, cx: &Cx, write: &PendingWrite) -> Outcome<(), Error> {
        match self.run_statement(cx, &write.statement).await {
            Outcome::Ok(_) => {}
            Outcome::Err(Error::Query(q)) if q.kind == QueryErrorKind::Constraint => {
                tracing::debug!(model = write.model, key = ?write.key, "Constraint violation");
                return Outcome::Err(Error::ConstraintViolation(ConstraintError {
                    model: write.model,
                    primary_key: write.key.clone(),
                    message: q.message.clone(),
                    source: Some(Box::new(Error::Query(q))),
                }));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if write.kind == WriteKind::Delete {
            self.forget(write.model, &write.key, &write.instance);
        }
        Outcome::Ok(())
    }

    async fn stage_write<M: Model>(
        &mut self,
        cx: &Cx,
        instance: &Instance<M>,
        kind: WriteKind,
    ) -> Outcome<Instance<M>, Error> {
        let write = match self.prepare_write(instance, kind) {
            Ok(write) => write,
            Err(e) => return Outcome::Err(e),
        };

        if self.work.in_scope() {
            if let Err(e) = self.work.ensure_not_aborted() {
                return Outcome::Err(e);
            }
            let canonical = match self.canonicalize(instance, &write.key) {
                Ok(canonical) => canonical,
                Err(e) => return Outcome::Err(e),
            };
            let write = PendingWrite {
                instance: canonical.erase(),
                ..write
            };
            tracing::debug!(model = M::MODEL_NAME, kind = ?kind, key = ?write.key, "Buffered write");
            return match self.work.stage(write) {
                Ok(()) => Outcome::Ok(canonical),
                Err(e) => Outcome::Err(e),
            };
        }

        // Autocommit: the write runs now and attaches only on success
        match self.execute_write(cx, &write).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.canonicalize(instance, &write.key) {
            Ok(canonical) => Outcome::Ok(canonical),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Insert `instance`, returning the canonical instance for its key.
    ///
    /// Outside a scope the INSERT runs immediately; a primary key conflict is
    /// a `ConstraintViolation`. Inside a scope it is buffered and conflicts
    /// surface from `flush` or `commit`.
    #[tracing::instrument(level = "debug", skip(self, cx, instance), fields(model = M::MODEL_NAME))]
    pub async fn add<M: Model>(&mut self, cx: &Cx, instance: &Instance<M>) -> Outcome<Instance<M>, Error> {
        self.stage_write(cx, instance, WriteKind::Insert).await
    }

    /// Insert or replace `instance`, returning the canonical instance.
    #[tracing::instrument(level = "debug", skip(self, cx, instance), fields(model = M::MODEL_NAME))]
    pub async fn upsert<M: Model>(
        &mut self,
        cx: &Cx,
        instance: &Instance<M>,
    ) -> Outcome<Instance<M>, Error> {
        self.stage_write(cx, instance, WriteKind::Upsert).await
    }

    /// Delete by primary key. Once executed, the canonical instance leaves
    /// the identity map and is detached.
    #[tracing::instrument(level = "debug", skip(self, cx, instance), fields(model = M::MODEL_NAME))]
    pub async fn delete<M: Model>(&mut self, cx: &Cx, instance: &Instance<M>) -> Outcome<(), Error> {
        let write = match self.prepare_write(instance, WriteKind::Delete) {
            Ok(write) => write,
            Err(e) => return Outcome::Err(e),
        };
        if self.work.in_scope() {
            tracing::debug!(key = ?write.key, "Buffered delete");
            return match self.work.stage(write) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            };
        }
        self.execute_write(cx, &write).await
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Execute buffered writes inside the open driver transaction.
    ///
    /// A failing write rolls the scope back before the error is returned.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.work.has_pending() {
            return Outcome::Ok(());
        }
        let writes = self.work.take_pending();
        tracing::debug!(count = writes.len(), "Flushing buffered writes");
        for write in &writes {
            match self.execute_write(cx, write).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::debug!(error = %e, "Flush failed, rolling back scope");
                    self.abort_scope(cx).await;
                    return Outcome::Err(e);
                }
                // Interrupted calls already rolled the scope back
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Push a transaction scope. Only the outermost scope begins a driver
    /// transaction.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outermost = match self.work.push_scope() {
            Ok(outermost) => outermost,
            Err(e) => return Outcome::Err(e),
        };
        if !outermost {
            tracing::trace!(depth = self.work.depth(), "Entered nested scope");
            return Outcome::Ok(());
        }
        let Some(driver) = self.driver.as_ref() else {
            let _ = self.work.pop_scope();
            return Outcome::Err(closed_error());
        };
        match driver.begin(cx).await {
            Outcome::Ok(()) => {
                self.work.set_driver_tx_open(true);
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                let _ = self.work.pop_scope();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                let _ = self.work.pop_scope();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                let _ = self.work.pop_scope();
                Outcome::Panicked(p)
            }
        }
    }

    /// Pop a scope. The outermost pop flushes and commits.
    ///
    /// Fails with a transaction error when a nested scope rolled back.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.work.ensure_in_scope() {
            return Outcome::Err(e);
        }
        if let Err(e) = self.work.ensure_not_aborted() {
            let _ = self.work.pop_scope();
            return Outcome::Err(e);
        }
        if self.work.depth() > 1 {
            let _ = self.work.pop_scope();
            return Outcome::Ok(());
        }

        match self.flush(cx).await {
            Outcome::Ok(()) => {}
            other => {
                let _ = self.work.pop_scope();
                return other;
            }
        }

        let Some(driver) = self.driver.as_ref() else {
            let _ = self.work.pop_scope();
            return Outcome::Err(closed_error());
        };
        let outcome = driver.commit(cx).await;
        match outcome {
            Outcome::Ok(()) => {
                self.work.set_driver_tx_open(false);
                tracing::debug!("Committed transaction");
            }
            _ => {
                tracing::debug!("Driver commit failed, rolling back");
                self.abort_scope(cx).await;
            }
        }
        let _ = self.work.pop_scope();
        outcome
    }

    /// Discard buffered writes, roll back the driver transaction and undo
    /// identity map changes made inside the scope. Outer scopes can no longer
    /// commit.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.work.ensure_in_scope() {
            return Outcome::Err(e);
        }
        self.abort_scope(cx).await;
        let _ = self.work.pop_scope();
        Outcome::Ok(())
    }

    async fn abort_scope(&mut self, cx: &Cx) {
        if self.work.driver_tx_open() {
            self.work.set_driver_tx_open(false);
            if let Some(driver) = self.driver.as_ref() {
                match driver.rollback(cx).await {
                    Outcome::Ok(()) => tracing::debug!(session = %self.id, "Rolled back transaction"),
                    other => tracing::debug!(session = %self.id, outcome = ?other, "Driver rollback failed"),
                }
            }
        }
        for entry in self.work.abort() {
            match entry {
                JournalEntry::Attached { model, key } => {
                    if let Some(instance) = self.identity.remove(model, &key) {
                        instance.set_owner(None);
                    }
                }
                JournalEntry::Removed {
                    model,
                    key,
                    instance,
                } => {
                    instance.set_owner(Some(self.id));
                    self.identity.insert(model, key, instance);
                }
                JournalEntry::Refreshed { instance, previous } => {
                    if let Err(e) = instance.refresh_from(&previous) {
                        tracing::debug!(
                            model = instance.model_name(),
                            error = %e,
                            "Could not restore instance values"
                        );
                    }
                }
            }
        }
    }

    /// Run `f` inside `begin`/`commit`.
    ///
    /// Anything but `Outcome::Ok` from `f` rolls back and is returned
    /// unchanged. Nested calls share the outermost boundary.
    pub async fn transaction<T, F>(&mut self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        match self.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match f(&mut *self).await {
            Outcome::Ok(value) => match self.commit(cx).await {
                Outcome::Ok(()) => Outcome::Ok(value),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            other => {
                tracing::debug!(session = %self.id, "Transaction body failed, rolling back");
                if let Outcome::Err(e) = self.rollback(cx).await {
                    tracing::debug!(error = %e, "Rollback after failure failed");
                }
                other
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Roll back any open scope, detach every instance and release the
    /// driver.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.work.in_scope() {
            tracing::debug!(depth = self.work.depth(), "Closing with an open scope, rolling back");
            self.abort_scope(cx).await;
            while self.work.pop_scope().is_ok_and(|depth| depth > 0) {}
        }
        self.detach_all();
        match self.driver.take() {
            Some(driver) => match driver.close(cx).await {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(()),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.work.driver_tx_open()
    }

    pub fn scope_depth(&self) -> usize {
        self.work.depth()
    }

    pub fn pending_write_count(&self) -> usize {
        self.work.pending().len()
    }

    pub fn tracked_count(&self) -> usize {
        self.identity.len()
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            id: self.id,
            tracked: self.identity.len(),
            pending_writes: self.work.pending().len(),
            scope_depth: self.work.depth(),
            aborted: self.work.is_aborted(),
            in_transaction: self.work.driver_tx_open(),
            stats: self.stats,
        }
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.identity.is_empty() {
            tracing::debug!(
                session = %self.id,
                tracked = self.identity.len(),
                "Session dropped without close, detaching instances"
            );
        }
        self.detach_all();
    }
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("scope_depth", &self.work.depth())
            .field("pending_writes", &self.work.pending().len())
            .finish()
    }
}

impl<D: Driver> QueryExecutor for Session<D> {
    fn fetch_instances<M: Model>(
        &mut self,
        cx: &Cx,
        statement: CompiledStatement,
        includes: &[&'static str],
    ) -> impl Future<Output = Outcome<Vec<Instance<M>>, Error>> + Send {
        self.fetch_instances_impl::<M>(cx, statement, includes)
    }

    fn fetch_rows(
        &mut self,
        cx: &Cx,
        statement: CompiledStatement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.fetch_rows_impl(cx, statement)
    }
}

impl<D: Driver> Session<D> {
    async fn fetch_instances_impl<M: Model>(
        &mut self,
        cx: &Cx,
        statement: CompiledStatement,
        includes: &[&'static str],
    ) -> Outcome<Vec<Instance<M>>, Error> {
        let descriptor = match self.registry.register::<M>() {
            Ok(descriptor) => descriptor,
            Err(e) => return Outcome::Err(e),
        };
        match self.auto_flush(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let rows = match self.run_statement(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.hydrate_any(&descriptor, row) {
                Ok(instance) => instances.push(instance),
                Err(e) => return Outcome::Err(e),
            }
        }
        for include in includes {
            match self.eager_load(cx, &descriptor, include, &instances).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match instances
            .iter()
            .map(downcast_instance::<M>)
            .collect::<Result<Vec<_>>>()
        {
            Ok(typed) => Outcome::Ok(typed),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn fetch_rows_impl(&mut self, cx: &Cx, statement: CompiledStatement) -> Outcome<Vec<Row>, Error> {
        match self.auto_flush(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.run_statement(cx, &statement).await
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
