//! Database driver interface.
//!
//! The session talks to the database only through [`Driver`]. A driver
//! prepares statement text once and executes the prepared handle with bound
//! values; the session's statement cache decides when to prepare.
//!
//! All operations take a `Cx` and return an `Outcome` so cancellation
//! propagates the same way as in the rest of the stack.

use crate::error::{ConfigError, Error, Result};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A statement prepared by the driver.
///
/// Handles are only valid on the connection that prepared them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Driver-assigned identifier
    id: u64,
    /// [`Driver::connection_id`] of the preparing connection
    connection: u64,
    /// Full statement text, including the `DECLARE` header
    text: String,
    param_count: usize,
}

impl PreparedStatement {
    /// Create a prepared statement handle. Called by drivers.
    pub fn new(id: u64, text: impl Into<String>, param_count: usize) -> Self {
        Self {
            id,
            connection: 0,
            text: text.into(),
            param_count,
        }
    }

    /// Tag the handle with the connection that prepared it.
    pub const fn on_connection(mut self, connection: u64) -> Self {
        self.connection = connection;
        self
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn connection(&self) -> u64 {
        self.connection
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    /// Check that the bound values match the declared parameters.
    pub fn validate_params(&self, params: &[Value]) -> bool {
        params.len() == self.param_count
    }
}

/// Driver connection to a database endpoint.
pub trait Driver: Send + Sync + Sized {
    /// Connect to the endpoint described by `config`.
    fn open(cx: &Cx, config: &ConnectionConfig) -> impl Future<Output = Outcome<Self, Error>> + Send;

    /// Identity of the underlying connection. Clones of one connection
    /// report the same id; prepared statements are cached per id.
    fn connection_id(&self) -> u64;

    /// Wait until the endpoint accepts requests, failing after `timeout`.
    fn wait_ready(
        &self,
        cx: &Cx,
        timeout: Duration,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Prepare statement text for repeated execution.
    fn prepare(
        &self,
        cx: &Cx,
        text: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send;

    /// Execute a prepared statement. Writes return no rows.
    fn execute(
        &self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Open a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Release the connection.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

fn default_wait_ready_ms() -> u64 {
    10_000
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoint, e.g. `grpc://localhost:2136`
    pub endpoint: String,
    /// Database path, e.g. `/local`
    pub database: String,
    #[serde(default = "default_wait_ready_ms")]
    pub wait_ready_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: String::new(),
            wait_ready_timeout_ms: default_wait_ready_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn wait_ready_timeout(mut self, ms: u64) -> Self {
        self.wait_ready_timeout_ms = ms;
        self
    }

    pub fn wait_ready_duration(&self) -> Duration {
        Duration::from_millis(self.wait_ready_timeout_ms)
    }

    /// Parse settings from JSON. A missing readiness timeout takes its default.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.endpoint.is_empty() {
            return Err(Error::Config(ConfigError {
                message: "connection endpoint must not be empty".to_string(),
                source: None,
            }));
        }
        Ok(config)
    }
}
