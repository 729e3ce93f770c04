#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Named embedded `SQLite` connections with synchronous and asynchronous
//! execution.
//!
//! A [`Registry`] owns every open connection by name, a bounded pool of worker
//! threads, and the per-connection queues that keep work on one connection
//! strictly serialized.
//!
//! ```rust,no_run
//! use switchy_sqlite::{Config, DynValue, Registry};
//!
//! # fn main() -> Result<(), switchy_sqlite::DatabaseError> {
//! let registry = Registry::new(Config::default().with_base_dir("/tmp/dbs"))?;
//! registry.open("app", None)?;
//! registry.execute("app", "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])?;
//!
//! registry.transaction("app", |tx| {
//!     tx.execute("INSERT INTO t (name) VALUES (?)", &[DynValue::from("alice")])?;
//!     Ok(())
//! })?;
//!
//! let result = registry.execute("app", "SELECT name FROM t", &[])?;
//! assert_eq!(result.rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod functions;
pub mod registry;
pub mod transaction;
pub mod value;

use thiserror::Error;

pub use batch::{BatchCommand, BatchParams, BatchResult};
pub use config::{Config, ConfigError};
pub use dispatcher::{Dispatcher, Pending};
pub use executor::{ColumnMetadata, OperationResult, ResultRow};
pub use functions::{AggregateSpec, AggregateStart, FunctionFlags, FunctionKind};
pub use registry::{ConnectionHandle, Registry};
pub use transaction::{Transaction, TransactionState};
pub use value::{DynValue, SqlValue};

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// No open connection (or attached alias) with this name
    #[error("Connection '{0}' not found")]
    NotFound(String),
    #[error("Connection '{0}' is already open")]
    AlreadyOpen(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Statement expects {expected} parameter(s) but {provided} were provided")]
    ParamMismatch { expected: usize, provided: usize },
    /// Error reported by the storage engine. The message is passed through
    /// verbatim so callers can match on it.
    #[error("{message}")]
    Sql { message: String },
    #[error("{0}")]
    Callback(String),
    #[error("Transaction already closed")]
    TransactionClosed,
    #[error("{source} (rollback also failed: {rollback})")]
    RollbackFailed {
        source: Box<DatabaseError>,
        rollback: String,
    },
    #[error("Work item was dropped before it completed")]
    Canceled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DatabaseError {
    /// Builds a [`DatabaseError::Callback`] from anything displayable.
    #[must_use]
    pub fn callback(message: impl std::fmt::Display) -> Self {
        Self::Callback(message.to_string())
    }

    /// The engine's message when this is (or wraps) an engine error.
    #[must_use]
    pub fn sql_message(&self) -> Option<&str> {
        match self {
            Self::Sql { message } => Some(message),
            Self::RollbackFailed { source, .. } => source.sql_message(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(value: rusqlite::Error) -> Self {
        let message = match &value {
            rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
            rusqlite::Error::UserFunctionError(e) => e.to_string(),
            other => other.to_string(),
        };

        Self::Sql { message }
    }
}
