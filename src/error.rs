//! Error types for the DRDA client
//!
//! Every failure surfaced to callers is an [`Error`]. SQL failures, whether
//! raised by the server or by client-side validation, arrive as
//! [`Error::Sql`] carrying a [`SqlError`]: the usual SQL exception shape with
//! a message, SQLSTATE, error code and a `next` link to the rest of the chain.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::constants::BATCH_POSITION_PREFIX;
use crate::exception::MessageId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the DRDA client
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    // =========================================================================
    // SQL Errors
    // =========================================================================
    /// SQL exception chain (server diagnostics or client validation)
    #[error(transparent)]
    Sql(Box<SqlError>),

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// Invalid connection string
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Connection timeout
    #[error("connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Underlying I/O error outside of an established session
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Get the SQL error, if this is one
    pub fn as_sql(&self) -> Option<&SqlError> {
        match self {
            Error::Sql(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE of the head of the chain
    pub fn sql_state(&self) -> Option<&str> {
        self.as_sql().map(|e| e.sql_state())
    }

    /// Client message id of the head of the chain
    pub fn message_id(&self) -> Option<MessageId> {
        self.as_sql().and_then(|e| e.message_id())
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Sql(e) => {
                e.kind() == &SqlErrorKind::Disconnect || e.sql_state().starts_with("08")
            }
            Error::ConnectionTimeout(_) | Error::Io(_) => true,
            Error::InvalidConnectionString(_) => false,
        }
    }
}

impl From<SqlError> for Error {
    fn from(e: SqlError) -> Self {
        Error::Sql(Box::new(e))
    }
}

/// Kind of a [`SqlError`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// Ordinary error
    Error,
    /// Non-fatal warning
    Warning,
    /// The session is no longer usable
    Disconnect,
    /// A batch failed; counts for every slot, failed slots hold
    /// [`EXECUTE_FAILED`](crate::constants::EXECUTE_FAILED)
    BatchUpdate { update_counts: Vec<i64> },
}

/// A SQL exception with its chained successors
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct SqlError {
    kind: SqlErrorKind,
    message: String,
    sql_state: String,
    error_code: i32,
    message_id: Option<MessageId>,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    next: Option<Box<SqlError>>,
}

impl SqlError {
    /// Create a new SQL error with no successor
    pub fn new(
        kind: SqlErrorKind,
        message: impl Into<String>,
        sql_state: impl Into<String>,
        error_code: i32,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            sql_state: sql_state.into(),
            error_code,
            message_id: None,
            cause: None,
            next: None,
        }
    }

    pub(crate) fn with_message_id(mut self, id: Option<MessageId>) -> Self {
        self.message_id = id;
        self
    }

    pub(crate) fn with_cause(
        mut self,
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = cause.map(Arc::from);
        self
    }

    /// Prefix every message of this chain with a batch slot
    pub(crate) fn label_batch(&mut self, index: usize) {
        self.message = format!("{}{}: {}", BATCH_POSITION_PREFIX, index, self.message);
        if let Some(next) = self.next.as_mut() {
            next.label_batch(index);
        }
    }

    pub(crate) fn set_next(&mut self, next: SqlError) {
        self.next = Some(Box::new(next));
    }

    /// Append a chain at the tail of this one
    pub(crate) fn append(&mut self, other: SqlError) {
        match &mut self.next {
            Some(next) => next.append(other),
            None => self.next = Some(Box::new(other)),
        }
    }

    /// Kind of this error
    pub fn kind(&self) -> &SqlErrorKind {
        &self.kind
    }

    /// Human readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Five character SQLSTATE
    pub fn sql_state(&self) -> &str {
        &self.sql_state
    }

    /// Vendor error code (server SQLCODE or client severity)
    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    /// Client message id, when the error was raised locally
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// Next error in the chain
    pub fn next(&self) -> Option<&SqlError> {
        self.next.as_deref()
    }

    /// Update counts, when this is a batch failure
    pub fn update_counts(&self) -> Option<&[i64]> {
        match &self.kind {
            SqlErrorKind::BatchUpdate { update_counts } => Some(update_counts),
            _ => None,
        }
    }

    /// Iterate over this error and every chained successor
    pub fn iter(&self) -> SqlErrorIter<'_> {
        SqlErrorIter { current: Some(self) }
    }

    /// Number of errors in the chain, including this one
    pub fn chain_len(&self) -> usize {
        self.iter().count()
    }
}

/// Iterator over a [`SqlError`] chain
#[derive(Debug)]
pub struct SqlErrorIter<'a> {
    current: Option<&'a SqlError>,
}

impl<'a> Iterator for SqlErrorIter<'a> {
    type Item = &'a SqlError;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next();
        Some(current)
    }
}
