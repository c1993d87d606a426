//! Unit of Work: pending writes and the transaction scope stack.
//!
//! The Unit of Work:
//! - Buffers compiled INSERT / UPSERT / DELETE statements while a scope is open
//! - Tracks scope nesting; only the outermost scope maps to a driver transaction
//! - Journals identity map changes made inside the scope so a rollback can
//!   undo them
//! - Records an aborted stack so outer scopes cannot commit after an inner
//!   rollback
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! assert!(uow.push_scope()?);   // outermost
//! assert!(!uow.push_scope()?);  // nested, shares the boundary
//!
//! uow.stage(write)?;
//! let writes = uow.take_pending();
//! ```

use ydborm_core::{
    AnyInstance, Error, Result, Row, TransactionError, TransactionErrorKind, Value,
};
use ydborm_query::CompiledStatement;

/// What a pending write does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Upsert,
    Delete,
}

/// A compiled write waiting for flush.
#[derive(Debug)]
pub struct PendingWrite {
    pub kind: WriteKind,
    pub model: &'static str,
    /// Normalized primary key of the written row
    pub key: Vec<Value>,
    pub statement: CompiledStatement,
    pub instance: AnyInstance,
}

/// Identity map change made inside a scope.
#[derive(Debug)]
pub enum JournalEntry {
    /// An instance was attached under this key
    Attached {
        model: &'static str,
        key: Vec<Value>,
    },
    /// An instance was removed after a flushed delete
    Removed {
        model: &'static str,
        key: Vec<Value>,
        instance: AnyInstance,
    },
    /// A canonical instance was overwritten in place; `previous` holds its
    /// values before the change
    Refreshed {
        instance: AnyInstance,
        previous: Row,
    },
}

/// Scope stack, write buffer and journal of one session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    depth: usize,
    aborted: bool,
    driver_tx_open: bool,
    pending: Vec<PendingWrite>,
    journal: Vec<JournalEntry>,
}

fn not_active(message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: message.to_string(),
    })
}

fn aborted() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::Aborted,
        message: "transaction was rolled back by a nested scope".to_string(),
    })
}

impl UnitOfWork {
    /// Create a new empty Unit of Work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_scope(&self) -> bool {
        self.depth > 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn driver_tx_open(&self) -> bool {
        self.driver_tx_open
    }

    pub fn set_driver_tx_open(&mut self, open: bool) {
        self.driver_tx_open = open;
    }

    /// Push a scope. Returns `true` for the outermost scope, which the
    /// caller must back with a driver transaction.
    #[allow(clippy::result_large_err)]
    pub fn push_scope(&mut self) -> Result<bool> {
        if self.aborted {
            return Err(aborted());
        }
        self.depth += 1;
        Ok(self.depth == 1)
    }

    /// Pop a scope, returning the remaining depth. Reaching zero resets the
    /// stack, including the aborted flag.
    #[allow(clippy::result_large_err)]
    pub fn pop_scope(&mut self) -> Result<usize> {
        if self.depth == 0 {
            return Err(not_active("no open transaction scope"));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.reset();
        }
        Ok(self.depth)
    }

    #[allow(clippy::result_large_err)]
    pub fn ensure_in_scope(&self) -> Result<()> {
        if self.in_scope() {
            Ok(())
        } else {
            Err(not_active("no open transaction scope"))
        }
    }

    /// Fail if the stack has been aborted by a rollback.
    #[allow(clippy::result_large_err)]
    pub fn ensure_not_aborted(&self) -> Result<()> {
        if self.aborted { Err(aborted()) } else { Ok(()) }
    }

    /// Buffer a write. Only valid inside a live scope.
    #[allow(clippy::result_large_err)]
    pub fn stage(&mut self, write: PendingWrite) -> Result<()> {
        if !self.in_scope() {
            return Err(not_active("writes are buffered only inside a scope"));
        }
        self.ensure_not_aborted()?;
        self.pending.push(write);
        Ok(())
    }

    /// Take the buffered writes in staging order.
    pub fn take_pending(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[PendingWrite] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Journal an identity map change. Ignored outside a scope, where there
    /// is nothing to undo.
    pub fn record(&mut self, entry: JournalEntry) {
        if self.in_scope() {
            self.journal.push(entry);
        }
    }

    /// Abandon the scope's work: drop buffered writes and hand back the
    /// journal, newest first, for undoing. The stack stays aborted until the
    /// depth reaches zero.
    pub fn abort(&mut self) -> Vec<JournalEntry> {
        self.pending.clear();
        self.aborted = self.depth > 0;
        let mut journal = std::mem::take(&mut self.journal);
        journal.reverse();
        journal
    }

    fn reset(&mut self) {
        self.aborted = false;
        self.driver_tx_open = false;
        self.pending.clear();
        self.journal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ydborm_core::{ColumnType, FieldInfo, Instance, Model};
    use ydborm_query::{StatementKind, StatementShape};

    #[derive(Debug, Clone)]
    struct Team {
        id: i64,
    }

    impl Model for Team {
        const MODEL_NAME: &'static str = "Team";
        const TABLE_NAME: &'static str = "teams";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", ColumnType::Int64).primary_key(true)];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.id.into()]
        }
    }

    fn write(id: i64) -> PendingWrite {
        PendingWrite {
            kind: WriteKind::Insert,
            model: "Team",
            key: vec![Value::Int64(id)],
            statement: CompiledStatement {
                shape: StatementShape {
                    kind: StatementKind::Insert,
                    table: "teams",
                    columns: vec!["id"],
                    predicates: Vec::new(),
                    order: Vec::new(),
                    distinct: false,
                    has_limit: false,
                    has_offset: false,
                },
                text: "INSERT INTO `teams` (`id`) VALUES ($p1);".to_string(),
                params: vec![Value::Int64(id)],
            },
            instance: Instance::new(Team { id }).erase(),
        }
    }

    #[test]
    fn test_only_outermost_scope_is_boundary() {
        let mut uow = UnitOfWork::new();
        assert!(uow.push_scope().unwrap());
        assert!(!uow.push_scope().unwrap());
        assert_eq!(uow.depth(), 2);

        assert_eq!(uow.pop_scope().unwrap(), 1);
        assert_eq!(uow.pop_scope().unwrap(), 0);
        assert!(!uow.in_scope());
    }

    #[test]
    fn test_pop_without_scope_is_not_active() {
        let mut uow = UnitOfWork::new();
        match uow.pop_scope() {
            Err(Error::Transaction(e)) => assert_eq!(e.kind, TransactionErrorKind::NotActive),
            other => panic!("expected NotActive, got {other:?}"),
        }
    }

    #[test]
    fn test_stage_requires_scope() {
        let mut uow = UnitOfWork::new();
        assert!(uow.stage(write(1)).is_err());

        uow.push_scope().unwrap();
        uow.stage(write(1)).unwrap();
        uow.stage(write(2)).unwrap();
        let taken = uow.take_pending();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].key, vec![Value::Int64(1)]);
        assert!(!uow.has_pending());
    }

    #[test]
    fn test_abort_blocks_outer_scope_until_reset() {
        let mut uow = UnitOfWork::new();
        uow.push_scope().unwrap();
        uow.push_scope().unwrap();
        uow.stage(write(1)).unwrap();
        uow.record(JournalEntry::Attached {
            model: "Team",
            key: vec![Value::Int64(1)],
        });
        uow.record(JournalEntry::Attached {
            model: "Team",
            key: vec![Value::Int64(2)],
        });

        let journal = uow.abort();
        assert!(matches!(
            &journal[0],
            JournalEntry::Attached { key, .. } if key == &vec![Value::Int64(2)]
        ));
        assert!(!uow.has_pending());
        assert!(uow.is_aborted());

        uow.pop_scope().unwrap();
        assert!(uow.stage(write(3)).is_err());
        assert!(uow.push_scope().is_err());

        uow.pop_scope().unwrap();
        assert!(!uow.is_aborted());
        assert!(uow.push_scope().unwrap());
    }

    #[test]
    fn test_journal_ignored_outside_scope() {
        let mut uow = UnitOfWork::new();
        uow.record(JournalEntry::Attached {
            model: "Team",
            key: vec![Value::Int64(1)],
        });
        assert!(uow.abort().is_empty());
        assert!(!uow.is_aborted());
    }
}
