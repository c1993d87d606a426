//! Error types for ydborm operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all ydborm operations.
#[derive(Debug)]
pub enum Error {
    /// Zero rows where exactly one was required
    NoResultFound(ResultContext),
    /// More than one row where exactly one was required
    MultipleResultsFound(ResultContext),
    /// Primary-key or other database-enforced constraint conflict
    ConstraintViolation(ConstraintError),
    /// Lazy access without a live owning session, or unresolved target model
    Relationship(RelationshipError),
    /// Predicate, projection or ordering spec rejected while building a query
    StatementCompilation(CompilationError),
    /// Statement execution errors reported by the driver
    Query(QueryError),
    /// Connection-related errors (open, readiness, closed session)
    Connection(ConnectionError),
    /// Type conversion errors while decoding rows
    Type(TypeError),
    /// Transaction scope errors
    Transaction(TransactionError),
    /// Configuration errors (registry conflicts, invalid settings)
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Identifies the query behind a `NoResultFound` / `MultipleResultsFound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultContext {
    /// Model the query targeted
    pub model: &'static str,
    /// Predicate shape, e.g. `id = ? AND age > ?`
    pub predicate: String,
}

#[derive(Debug)]
pub struct ConstraintError {
    /// Model whose write conflicted
    pub model: &'static str,
    /// Primary key of the conflicting row
    pub primary_key: Vec<Value>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct RelationshipError {
    pub kind: RelationshipErrorKind,
    /// Model that owns the relationship
    pub model: &'static str,
    /// Relationship name
    pub relationship: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipErrorKind {
    /// The instance has no owning session (never attached, or session closed)
    Detached,
    /// The instance belongs to a different session
    ForeignSession,
    /// No relationship with this name is declared on the model
    UnknownRelationship,
    /// The target model name is not registered
    UnresolvedTarget,
    /// The target model does not match the requested type
    TargetMismatch,
    /// Composite or missing key that the loader cannot follow
    UnsupportedKey,
}

#[derive(Debug, Clone)]
pub struct CompilationError {
    /// Model the query targets
    pub model: &'static str,
    /// Field or spec that was rejected, if any
    pub subject: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Statement text could not be parsed or prepared
    Syntax,
    /// Constraint violation reported by the driver
    Constraint,
    /// Table or column not found
    NotFound,
    /// The database aborted the transaction, e.g. invalidated locks
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Endpoint did not become ready in time
    NotReady,
    /// Connection lost or already closed
    Disconnected,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without an open scope
    NotActive,
    /// A nested scope already rolled back the shared boundary
    Aborted,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Get the statement text that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a statement compilation error.
    pub fn compilation(
        model: &'static str,
        subject: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::StatementCompilation(CompilationError {
            model,
            subject: subject.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build a relationship error.
    pub fn relationship(
        kind: RelationshipErrorKind,
        model: &'static str,
        relationship: &str,
        message: impl Into<String>,
    ) -> Self {
        Error::Relationship(RelationshipError {
            kind,
            model,
            relationship: relationship.to_string(),
            message: message.into(),
        })
    }

    /// Relationship error kind, if this is a relationship error.
    pub fn relationship_kind(&self) -> Option<RelationshipErrorKind> {
        match self {
            Error::Relationship(e) => Some(e.kind),
            _ => None,
        }
    }
}

fn fmt_key(key: &[Value]) -> String {
    key.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoResultFound(ctx) => write!(
                f,
                "No {} row found for query where {}",
                ctx.model, ctx.predicate
            ),
            Error::MultipleResultsFound(ctx) => write!(
                f,
                "Multiple {} rows found for query where {}",
                ctx.model, ctx.predicate
            ),
            Error::ConstraintViolation(e) => write!(f, "Constraint violation: {}", e),
            Error::Relationship(e) => write!(f, "Relationship error: {}", e),
            Error::StatementCompilation(e) => write!(f, "Statement compilation error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConstraintViolation(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with primary key ({}): {}",
            self.model,
            fmt_key(&self.primary_key),
            self.message
        )
    }
}

impl fmt::Display for RelationshipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.model, self.relationship, self.message)
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{} ('{}'): {}", self.model, subject, self.message),
            None => write!(f, "{}: {}", self.model, self.message),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "in column '{}': expected {}, found {}",
                col, self.expected, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<RelationshipError> for Error {
    fn from(err: RelationshipError) -> Self {
        Error::Relationship(err)
    }
}

impl From<CompilationError> for Error {
    fn from(err: CompilationError) -> Self {
        Error::StatementCompilation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for ydborm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_model_and_predicate() {
        let err = Error::NoResultFound(ResultContext {
            model: "User",
            predicate: "id = ?".to_string(),
        });
        assert_eq!(err.to_string(), "No User row found for query where id = ?");

        let err = Error::MultipleResultsFound(ResultContext {
            model: "User",
            predicate: "age > ?".to_string(),
        });
        assert!(err.to_string().contains("Multiple User rows"));
    }

    #[test]
    fn constraint_violation_names_the_key() {
        let err = Error::ConstraintViolation(ConstraintError {
            model: "User",
            primary_key: vec![Value::Int64(1)],
            message: "duplicate primary key".to_string(),
            source: None,
        });
        assert_eq!(
            err.to_string(),
            "Constraint violation: User with primary key (1): duplicate primary key"
        );
    }

    #[test]
    fn relationship_helpers() {
        let err = Error::relationship(
            RelationshipErrorKind::Detached,
            "User",
            "posts",
            "instance is not attached to a session",
        );
        assert_eq!(
            err.relationship_kind(),
            Some(RelationshipErrorKind::Detached)
        );
        assert!(err.to_string().contains("User.posts"));
        assert_eq!(Error::Custom("x".to_string()).relationship_kind(), None);
    }

    #[test]
    fn compilation_error_mentions_subject() {
        let err = Error::compilation("User", Some("nmae"), "unknown field");
        assert_eq!(
            err.to_string(),
            "Statement compilation error: User ('nmae'): unknown field"
        );
    }

    #[test]
    fn query_text_and_connection_flags() {
        let aborted = Error::Query(QueryError {
            kind: QueryErrorKind::Serialization,
            sql: Some("SELECT 1".to_string()),
            message: "conflict".to_string(),
            source: None,
        });
        assert_eq!(aborted.sql(), Some("SELECT 1"));
        assert!(!aborted.is_connection_error());

        let conn = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "closed".to_string(),
            source: None,
        });
        assert!(conn.is_connection_error());
        assert_eq!(conn.sql(), None);
    }
}
