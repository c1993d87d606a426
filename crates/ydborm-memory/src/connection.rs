//! In-process driver connection implementing `ydborm_core::Driver`.
//!
//! Tables live in a [`Database`] guarded by a mutex and shared by every clone
//! of a [`MemoryDriver`]. Connections opened through [`Driver::open`] with the
//! same database path share one store, the way sessions connected to the same
//! YDB database see each other's committed rows.
//!
//! All operations execute synchronously under the mutex; the trait methods
//! wrap the `*_sync` helpers in ready futures.
//!
//! A transaction keeps an undo log of its own writes. Rolling back replays
//! the log in reverse, so rows committed meanwhile by other connections to
//! the same database survive.

#![allow(clippy::result_large_err)]

use crate::statement::{self, Condition, ParsedText, RowAccess, Statement};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use asupersync::CancelReason;
use ydborm_core::{
    ColumnInfo, ConnectionConfig, ConnectionError, ConnectionErrorKind, Cx, Driver, Error, Model,
    Outcome, PreparedStatement, QueryError, QueryErrorKind, Result, Row, Value,
};

/// One stored table.
#[derive(Debug, Clone)]
struct Table {
    columns: Arc<ColumnInfo>,
    /// Indexes of the primary key columns
    primary_key: Vec<usize>,
    rows: Vec<Vec<Value>>,
}

struct StoredRow<'a> {
    columns: &'a ColumnInfo,
    values: &'a [Value],
}

impl RowAccess for StoredRow<'_> {
    fn column(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }
}

impl Table {
    fn new(columns: &[&str], primary_key: &[&str]) -> Self {
        let columns = ColumnInfo::new(columns.iter().map(|c| (*c).to_string()).collect());
        let primary_key = primary_key
            .iter()
            .filter_map(|c| columns.index_of(c))
            .collect();
        Self {
            columns: Arc::new(columns),
            primary_key,
            rows: Vec::new(),
        }
    }

    fn view<'a>(&'a self, values: &'a [Value]) -> StoredRow<'a> {
        StoredRow {
            columns: &self.columns,
            values,
        }
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .index_of(column)
            .ok_or_else(|| not_found(format!("unknown column {}", column)))
    }

    fn position_of_key(&self, values: &[Value]) -> Option<usize> {
        self.rows.iter().position(|row| {
            self.primary_key
                .iter()
                .all(|&i| row[i].loosely_equals(&values[i]))
        })
    }

    fn filtered(&self, filter: &[Condition], params: &[Value]) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            if statement::matches(&self.view(row), filter, params)? {
                hits.push(i);
            }
        }
        Ok(hits)
    }

    fn project(&self, indexes: &[usize], columns: &[String]) -> Result<Vec<Vec<Value>>> {
        let positions = columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(indexes
            .iter()
            .map(|&i| positions.iter().map(|&p| self.rows[i][p].clone()).collect())
            .collect())
    }
}

/// Reverses one executed write.
#[derive(Debug)]
enum Undo {
    Inserted {
        table: String,
        values: Vec<Value>,
    },
    Replaced {
        table: String,
        previous: Vec<Value>,
    },
    /// Removed rows with their former positions, ascending
    Deleted {
        table: String,
        rows: Vec<(usize, Vec<Value>)>,
    },
}

/// Every table of one database.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: HashMap<String, Table>,
}

impl Database {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| not_found(format!("table {} does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| not_found(format!("table {} does not exist", name)))
    }

    fn undo(&mut self, log: Vec<Undo>) {
        for entry in log.into_iter().rev() {
            match entry {
                Undo::Inserted { table, values } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        if let Some(i) = t.position_of_key(&values) {
                            t.rows.remove(i);
                        }
                    }
                }
                Undo::Replaced { table, previous } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        if let Some(i) = t.position_of_key(&previous) {
                            t.rows[i] = previous;
                        }
                    }
                }
                Undo::Deleted { table, rows } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        for (index, values) in rows {
                            let at = index.min(t.rows.len());
                            t.rows.insert(at, values);
                        }
                    }
                }
            }
        }
    }
}

fn next_connection_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Connection-level state shared by clones of one driver.
#[derive(Debug, Default)]
struct ConnectionState {
    id: u64,
    closed: AtomicBool,
    not_ready: AtomicBool,
    next_statement_id: AtomicU64,
    statements: AtomicU64,
    prepares: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    /// Writes of the open transaction; `None` outside one
    undo: Mutex<Option<Vec<Undo>>>,
    prepared: Mutex<HashMap<u64, ParsedText>>,
    fail_next: Mutex<Option<(QueryErrorKind, String)>>,
    cancel_next: AtomicBool,
}

/// An in-process database connection.
///
/// Understands exactly the statements `ydborm-query` compiles. Clones share
/// both the table store and the connection state, so a test can keep a clone
/// to inspect what a session wrote.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    database: Arc<Mutex<Database>>,
    state: Arc<ConnectionState>,
    name: String,
}

fn shared_databases() -> &'static Mutex<HashMap<String, Arc<Mutex<Database>>>> {
    static DATABASES: OnceLock<Mutex<HashMap<String, Arc<Mutex<Database>>>>> = OnceLock::new();
    DATABASES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// A connection to a private, empty database.
    pub fn new() -> Self {
        Self::over(Arc::new(Mutex::new(Database::default())), ":memory:")
    }

    /// A connection to the process-wide database registered under `name`.
    pub fn shared(name: &str) -> Self {
        let database = {
            let mut databases = shared_databases()
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            Arc::clone(databases.entry(name.to_string()).or_default())
        };
        Self::over(database, name)
    }

    fn over(database: Arc<Mutex<Database>>, name: &str) -> Self {
        Self {
            database,
            state: Arc::new(ConnectionState {
                id: next_connection_id(),
                ..ConnectionState::default()
            }),
            name: name.to_string(),
        }
    }

    /// Database path this connection is attached to.
    pub fn database_name(&self) -> &str {
        &self.name
    }

    /// Create a table unless it already exists.
    pub fn create_table(&self, table: &str, columns: &[&str], primary_key: &[&str]) {
        let mut db = self.database.lock().unwrap_or_else(|e| e.into_inner());
        db.tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(columns, primary_key));
    }

    /// Create the table backing model `M`.
    pub fn create_table_for<M: Model>(&self) {
        let columns = M::column_names();
        self.create_table(M::TABLE_NAME, &columns, M::PRIMARY_KEY);
    }

    /// Store a row directly, bypassing statements. Missing columns are NULL;
    /// an existing row with the same key is replaced.
    pub fn insert_row(&self, table: &str, row: &Row) -> Result<()> {
        let mut db = self.database.lock().unwrap_or_else(|e| e.into_inner());
        let table = db.table_mut(table)?;
        let mut values = vec![Value::Null; table.columns.len()];
        for (name, value) in row.iter() {
            values[table.column_index(name)?] = value.clone();
        }
        match table.position_of_key(&values) {
            Some(i) => table.rows[i] = values,
            None => table.rows.push(values),
        }
        Ok(())
    }

    /// Snapshot of a table's rows in storage order. Empty for unknown tables.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        let db = self.database.lock().unwrap_or_else(|e| e.into_inner());
        db.tables.get(table).map_or_else(Vec::new, |t| {
            t.rows
                .iter()
                .map(|values| Row::with_columns(Arc::clone(&t.columns), values.clone()))
                .collect()
        })
    }

    /// Statements executed so far.
    pub fn statement_count(&self) -> u64 {
        self.state.statements.load(Ordering::SeqCst)
    }

    /// Statements prepared so far.
    pub fn prepare_count(&self) -> u64 {
        self.state.prepares.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn in_transaction(&self) -> bool {
        self.state
            .undo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Make `wait_ready` fail (or succeed again).
    pub fn set_ready(&self, ready: bool) {
        self.state.not_ready.store(!ready, Ordering::SeqCst);
    }

    /// Fail the next `execute` with a query error of `kind`.
    pub fn fail_next_execute(&self, kind: QueryErrorKind, message: impl Into<String>) {
        *self
            .state
            .fail_next
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((kind, message.into()));
    }

    /// Report the next `execute` as cancelled without running it.
    pub fn cancel_next_execute(&self) {
        self.state.cancel_next.store(true, Ordering::SeqCst);
    }

    fn take_cancellation(&self) -> Option<CancelReason> {
        self.state
            .cancel_next
            .swap(false, Ordering::SeqCst)
            .then(|| CancelReason::user("execute cancelled"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "connection is closed".to_string(),
                source: None,
            }))
        } else {
            Ok(())
        }
    }

    fn wait_ready_sync(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        if self.state.not_ready.load(Ordering::SeqCst) {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::NotReady,
                message: format!(
                    "database {} not ready after {}ms",
                    self.name,
                    timeout.as_millis()
                ),
                source: None,
            }));
        }
        Ok(())
    }

    /// Parse and register statement text.
    pub fn prepare_sync(&self, text: &str) -> Result<PreparedStatement> {
        self.ensure_open()?;
        let parsed = statement::parse(text)?;
        let id = self.state.next_statement_id.fetch_add(1, Ordering::SeqCst) + 1;
        let param_count = parsed.declared.len();
        self.state
            .prepared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, parsed);
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id, params = param_count, "prepared statement");
        Ok(PreparedStatement::new(id, text, param_count).on_connection(self.state.id))
    }

    /// Execute a prepared statement with bound values.
    pub fn execute_sync(&self, prepared: &PreparedStatement, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        if prepared.connection() != self.state.id {
            return Err(query_error(
                QueryErrorKind::Database,
                prepared.text(),
                format!(
                    "statement {} was prepared on connection {}, not {}",
                    prepared.id(),
                    prepared.connection(),
                    self.state.id
                ),
            ));
        }
        self.state.statements.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .state
            .fail_next
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((kind, message)) = injected {
            return Err(query_error(kind, prepared.text(), message));
        }

        if !prepared.validate_params(params) {
            return Err(query_error(
                QueryErrorKind::Database,
                prepared.text(),
                format!(
                    "expected {} parameters, got {}",
                    prepared.param_count(),
                    params.len()
                ),
            ));
        }

        let cached = self
            .state
            .prepared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&prepared.id())
            .map(|p| p.statement.clone());
        let statement = match cached {
            Some(statement) => statement,
            None => statement::parse(prepared.text())?.statement,
        };

        let mut undo = self.state.undo.lock().unwrap_or_else(|e| e.into_inner());
        let mut db = self.database.lock().unwrap_or_else(|e| e.into_inner());
        let result = run(&mut db, &statement, params, undo.as_mut())
            .map_err(|e| with_text(e, prepared.text()));
        tracing::trace!(
            id = prepared.id(),
            table = statement.table(),
            write = statement.is_write(),
            ok = result.is_ok(),
            "executed statement"
        );
        result
    }

    fn begin_sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut undo = self.state.undo.lock().unwrap_or_else(|e| e.into_inner());
        if undo.is_some() {
            return Err(query_error(
                QueryErrorKind::Database,
                "BEGIN",
                "already in a transaction",
            ));
        }
        *undo = Some(Vec::new());
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut undo = self.state.undo.lock().unwrap_or_else(|e| e.into_inner());
        if undo.take().is_none() {
            return Err(query_error(
                QueryErrorKind::Database,
                "COMMIT",
                "not in a transaction",
            ));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut undo = self.state.undo.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = undo.take() else {
            return Err(query_error(
                QueryErrorKind::Database,
                "ROLLBACK",
                "not in a transaction",
            ));
        };
        tracing::trace!(writes = log.len(), "undoing transaction");
        self.database
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .undo(log);
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_sync(&self) {
        // An open transaction is abandoned.
        let log = self
            .state
            .undo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(log) = log {
            self.database
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .undo(log);
        }
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Execute `statement`, appending the undo of any write to `undo`.
fn run(
    db: &mut Database,
    statement: &Statement,
    params: &[Value],
    undo: Option<&mut Vec<Undo>>,
) -> Result<Vec<Row>> {
    match statement {
        Statement::Select {
            table,
            columns,
            distinct,
            filter,
            order,
            limit,
            offset,
        } => {
            let t = db.table(table)?;
            let mut hits = t.filtered(filter, params)?;
            if !order.is_empty() {
                let keys = order
                    .iter()
                    .map(|k| t.column_index(&k.column).map(|i| (i, k.descending)))
                    .collect::<Result<Vec<_>>>()?;
                hits.sort_by(|&a, &b| {
                    keys.iter()
                        .map(|&(i, descending)| {
                            let ord = statement::order_values(&t.rows[a][i], &t.rows[b][i]);
                            if descending { ord.reverse() } else { ord }
                        })
                        .find(|ord| ord.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            let mut rows = t.project(&hits, columns)?;
            if *distinct {
                rows = statement::dedup_rows(rows);
            }
            let skip = offset
                .map(|i| statement::bound_count(params, i))
                .transpose()?
                .unwrap_or(0);
            let take = limit
                .map(|i| statement::bound_count(params, i))
                .transpose()?
                .unwrap_or(usize::MAX);
            let info = Arc::new(ColumnInfo::new(columns.clone()));
            Ok(rows
                .into_iter()
                .skip(skip)
                .take(take)
                .map(|values| Row::with_columns(Arc::clone(&info), values))
                .collect())
        }
        Statement::Count {
            table,
            distinct_columns,
            filter,
        } => {
            let t = db.table(table)?;
            let hits = t.filtered(filter, params)?;
            let count = match distinct_columns {
                Some(columns) => statement::dedup_rows(t.project(&hits, columns)?).len(),
                None => hits.len(),
            };
            Ok(vec![Row::new(
                vec!["count".to_string()],
                vec![Value::Uint64(count as u64)],
            )])
        }
        Statement::Insert {
            table,
            columns,
            params: slots,
            upsert,
        } => {
            let t = db.table_mut(table)?;
            let mut values = vec![Value::Null; t.columns.len()];
            let mut assigned = Vec::with_capacity(columns.len());
            for (column, &slot) in columns.iter().zip(slots) {
                let i = t.column_index(column)?;
                values[i] = params.get(slot).cloned().unwrap_or(Value::Null);
                assigned.push(i);
            }
            if t.primary_key.iter().any(|&i| values[i].is_null()) {
                return Err(query_error(
                    QueryErrorKind::Constraint,
                    "",
                    format!("primary key of {} must not be NULL", table),
                ));
            }
            match (t.position_of_key(&values), upsert) {
                (Some(_), false) => Err(query_error(
                    QueryErrorKind::Constraint,
                    "",
                    format!("duplicate primary key in {}", table),
                )),
                (Some(existing), true) => {
                    if let Some(undo) = undo {
                        undo.push(Undo::Replaced {
                            table: table.clone(),
                            previous: t.rows[existing].clone(),
                        });
                    }
                    for i in assigned {
                        t.rows[existing][i] = values[i].clone();
                    }
                    Ok(Vec::new())
                }
                (None, _) => {
                    if let Some(undo) = undo {
                        undo.push(Undo::Inserted {
                            table: table.clone(),
                            values: values.clone(),
                        });
                    }
                    t.rows.push(values);
                    Ok(Vec::new())
                }
            }
        }
        Statement::Delete { table, filter } => {
            let t = db.table_mut(table)?;
            let hits = t.filtered(filter, params)?;
            if let Some(undo) = undo {
                if !hits.is_empty() {
                    undo.push(Undo::Deleted {
                        table: table.clone(),
                        rows: hits.iter().map(|&i| (i, t.rows[i].clone())).collect(),
                    });
                }
            }
            let mut index = 0;
            t.rows.retain(|_| {
                let keep = !hits.contains(&index);
                index += 1;
                keep
            });
            Ok(Vec::new())
        }
    }
}

fn not_found(message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        message,
        source: None,
    })
}

fn query_error(kind: QueryErrorKind, sql: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        sql: (!sql.is_empty()).then(|| sql.to_string()),
        message: message.into(),
        source: None,
    })
}

fn with_text(err: Error, text: &str) -> Error {
    match err {
        Error::Query(mut q) if q.sql.is_none() => {
            q.sql = Some(text.to_string());
            Error::Query(q)
        }
        other => other,
    }
}

fn ready<T>(result: Result<T>) -> impl Future<Output = Outcome<T, Error>> + Send
where
    T: Send,
{
    async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
}

// ── Driver trait impl ─────────────────────────────────────────────────────

impl Driver for MemoryDriver {
    fn open(
        _cx: &Cx,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Outcome<Self, Error>> + Send {
        let result = if config.endpoint.is_empty() {
            Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "endpoint must not be empty".to_string(),
                source: None,
            }))
        } else {
            tracing::debug!(
                endpoint = %config.endpoint,
                database = %config.database,
                "opening in-memory connection"
            );
            Ok(Self::shared(&config.database))
        };
        ready(result)
    }

    fn wait_ready(
        &self,
        _cx: &Cx,
        timeout: Duration,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(self.wait_ready_sync(timeout))
    }

    fn prepare(
        &self,
        _cx: &Cx,
        text: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        ready(self.prepare_sync(text))
    }

    fn connection_id(&self) -> u64 {
        self.state.id
    }

    fn execute(
        &self,
        _cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.take_cancellation() {
            Some(reason) => Outcome::Cancelled(reason),
            None => self
                .execute_sync(statement, params)
                .map_or_else(Outcome::Err, Outcome::Ok),
        };
        async move { outcome }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(self.begin_sync())
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(self.commit_sync())
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(self.rollback_sync())
    }

    async fn close(self, _cx: &Cx) -> Result<()> {
        self.close_sync();
        tracing::debug!(database = %self.name, "closed in-memory connection");
        Ok(())
    }
}
