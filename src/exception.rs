//! Client exceptions and exception chains
//!
//! [`SqlException`] is the internal error type used throughout the session
//! core. Each exception takes its message from exactly one source: a server
//! [`Diagnostic`], a client [`MessageId`], a literal text, or an already
//! surfaced [`SqlError`]. Exceptions form a singly linked chain through
//! `next`.
//!
//! Diagnostic-backed messages are resolved lazily, because formatting them
//! may need a round trip to the server. Conversion to the public
//! [`SqlError`] happens once, at the API boundary, through
//! [`SqlException::into_sql_error`], which rebuilds the chain one to one.

use std::fmt;

use crate::constants::{error_code, sql_state, BATCH_POSITION_PREFIX};
use crate::diagnostic::{Diagnostic, MessageFormatter, Unformatted};
use crate::error::{Error, SqlError, SqlErrorKind};

/// Result type used inside the session core
pub type SqlResult<T> = std::result::Result<T, SqlException>;

/// Identifies a message raised by the client itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Zero or negative LOB position
    BlobBadPosition,
    /// Negative LOB length
    BlobNonpositiveLength,
    /// Null search pattern
    BlobNullPattern,
    /// Operation on a freed LOB
    LobFreed,
    /// Position past the end of the LOB
    BlobPositionTooLarge,
    /// Offset outside the source buffer
    BlobInvalidOffset,
    /// Length larger than the available source data
    BlobLengthTooLong,
    /// Invalid argument to an API call
    InvalidApiParameter,
    /// Position plus length past the end of the LOB
    PositionAndLengthGreaterThanLob,
    /// LOB modified after a stream over it was opened
    LobChanged,
    /// LOB no longer usable (connection closed or transaction ended)
    LobObjectInvalid,
    /// Batch finished with at least one failed element
    BatchNonAtomicFailure,
    /// Value does not fit the target type
    ValueTooLargeForType,
    /// I/O failure while reading a user stream
    StreamingIo,
    /// No open connection
    NoCurrentConnection,
    /// Communication failure; the session is unusable
    Disconnect,
    /// Server rejected the credentials
    AuthenticationFailed,
    /// Cryptographic failure during the security handshake
    SecurityExceptionEncountered,
    /// Malformed or unexpected protocol data
    ProtocolError,
    /// Message text could not be formatted by the server
    MessageTextUnavailable,
    /// The message formatting procedure is not installed
    MessageProcedureMissing,
}

impl MessageId {
    /// SQLSTATE raised with this message
    pub fn sql_state(self) -> &'static str {
        match self {
            MessageId::BlobBadPosition => sql_state::BLOB_BAD_POSITION,
            MessageId::BlobNonpositiveLength => sql_state::BLOB_NONPOSITIVE_LENGTH,
            MessageId::BlobNullPattern => sql_state::BLOB_NULL_PATTERN,
            MessageId::LobFreed => sql_state::LOB_FREED,
            MessageId::BlobPositionTooLarge => sql_state::BLOB_POSITION_TOO_LARGE,
            MessageId::BlobInvalidOffset => sql_state::BLOB_INVALID_OFFSET,
            MessageId::BlobLengthTooLong => sql_state::BLOB_LENGTH_TOO_LONG,
            MessageId::InvalidApiParameter => sql_state::INVALID_API_PARAMETER,
            MessageId::PositionAndLengthGreaterThanLob => {
                sql_state::POS_AND_LENGTH_GREATER_THAN_LOB
            }
            MessageId::LobChanged => sql_state::LOB_CHANGED,
            MessageId::LobObjectInvalid => sql_state::LOB_OBJECT_INVALID,
            MessageId::BatchNonAtomicFailure => sql_state::BATCH_NON_ATOMIC_FAILURE,
            MessageId::ValueTooLargeForType => sql_state::VALUE_TOO_LARGE_FOR_TYPE,
            MessageId::StreamingIo => sql_state::STREAMING_IO,
            MessageId::NoCurrentConnection => sql_state::NO_CURRENT_CONNECTION,
            MessageId::Disconnect => sql_state::DISCONNECT,
            MessageId::AuthenticationFailed => sql_state::AUTHENTICATION_FAILED,
            MessageId::SecurityExceptionEncountered => sql_state::SECURITY_EXCEPTION,
            MessageId::ProtocolError => sql_state::PROTOCOL_ERROR,
            MessageId::MessageTextUnavailable => sql_state::MESSAGE_TEXT_UNAVAILABLE,
            MessageId::MessageProcedureMissing => sql_state::MESSAGE_PROCEDURE_MISSING,
        }
    }

    fn kind(self) -> SqlErrorKind {
        match self {
            MessageId::Disconnect => SqlErrorKind::Disconnect,
            MessageId::MessageTextUnavailable | MessageId::MessageProcedureMissing => {
                SqlErrorKind::Warning
            }
            MessageId::BatchNonAtomicFailure => SqlErrorKind::BatchUpdate {
                update_counts: Vec::new(),
            },
            _ => SqlErrorKind::Error,
        }
    }

    fn error_code(self) -> i32 {
        match self {
            MessageId::MessageTextUnavailable | MessageId::MessageProcedureMissing => {
                error_code::WARNING_SEVERITY
            }
            MessageId::Disconnect
            | MessageId::NoCurrentConnection
            | MessageId::AuthenticationFailed
            | MessageId::SecurityExceptionEncountered => error_code::SESSION_SEVERITY,
            _ => error_code::STATEMENT_SEVERITY,
        }
    }

    fn render(self, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");
        match self {
            MessageId::BlobBadPosition => format!(
                "Negative or zero position argument '{}' passed in a BLOB or CLOB method.",
                arg(0)
            ),
            MessageId::BlobNonpositiveLength => format!(
                "Negative length argument '{}' passed in a BLOB or CLOB method.",
                arg(0)
            ),
            MessageId::BlobNullPattern => {
                "Empty pattern or search string passed in to a BLOB or CLOB position method."
                    .to_string()
            }
            MessageId::LobFreed => {
                "The BLOB or CLOB has been freed and can no longer be used.".to_string()
            }
            MessageId::BlobPositionTooLarge => format!(
                "The position argument '{}' exceeds the size of the BLOB/CLOB.",
                arg(0)
            ),
            MessageId::BlobInvalidOffset => format!(
                "Invalid offset '{}' into the source data.",
                arg(0)
            ),
            MessageId::BlobLengthTooLong => format!(
                "Length argument '{}' exceeds the data available in the source.",
                arg(0)
            ),
            MessageId::InvalidApiParameter => format!(
                "Invalid parameter value '{}' for '{}'.",
                arg(0),
                arg(1)
            ),
            MessageId::PositionAndLengthGreaterThanLob => format!(
                "Sum of position ('{}') and length ('{}') is greater than the size of the LOB plus one.",
                arg(0),
                arg(1)
            ),
            MessageId::LobChanged => {
                "The BLOB or CLOB was modified after this stream was opened.".to_string()
            }
            MessageId::LobObjectInvalid => {
                "The data in this BLOB or CLOB is no longer available. Its transaction may be committed or its connection closed."
                    .to_string()
            }
            MessageId::BatchNonAtomicFailure => {
                "Non-atomic batch failure. The batch was submitted, but at least one exception occurred on an individual member of the batch. Use next() to retrieve the exceptions for specific batched elements."
                    .to_string()
            }
            MessageId::ValueTooLargeForType => format!(
                "The resulting value is outside the range for the data type {}.",
                arg(0)
            ),
            MessageId::StreamingIo => format!(
                "An I/O error occurred while reading a {} from a stream: {}",
                arg(0),
                arg(1)
            ),
            MessageId::NoCurrentConnection => "No current connection.".to_string(),
            MessageId::Disconnect => format!(
                "A communications error has been detected: {}.",
                arg(0)
            ),
            MessageId::AuthenticationFailed => format!(
                "Connection authentication failure occurred. Reason: {}.",
                arg(0)
            ),
            MessageId::SecurityExceptionEncountered => format!(
                "Security exception encountered: {}.",
                arg(0)
            ),
            MessageId::ProtocolError => format!(
                "Execution failed due to a distribution protocol error: {}.",
                arg(0)
            ),
            MessageId::MessageTextUnavailable => {
                "Unable to obtain message text from server. See chained exception.".to_string()
            }
            MessageId::MessageProcedureMissing => {
                "Unable to obtain message text from server. The stored procedure SYSIBM.SQLCAMESSAGE is not installed on the server."
                    .to_string()
            }
        }
    }
}

#[derive(Debug)]
enum MessageSource {
    Diagnostic(Box<Diagnostic>),
    Client { id: MessageId, args: Vec<String> },
    Text(String),
    External(Box<SqlError>),
}

/// A chainable SQL exception raised inside the session core
#[derive(Debug)]
pub struct SqlException {
    kind: SqlErrorKind,
    source: MessageSource,
    sql_state: String,
    error_code: i32,
    batch_position: Option<usize>,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    next: Option<Box<SqlException>>,
}

impl SqlException {
    fn from_source(kind: SqlErrorKind, source: MessageSource, state: &str, code: i32) -> Self {
        Self {
            kind,
            source,
            sql_state: state.to_string(),
            error_code: code,
            batch_position: None,
            cause: None,
            next: None,
        }
    }

    /// Create an exception for a client message id
    pub fn client<I>(id: MessageId, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        let args = args.into_iter().map(|a| a.to_string()).collect();
        Self::from_source(
            id.kind(),
            MessageSource::Client { id, args },
            id.sql_state(),
            id.error_code(),
        )
    }

    /// Create an exception chain from a server diagnostic
    ///
    /// A diagnostic carrying linked records becomes one exception per record,
    /// in the same order.
    pub fn from_diagnostic(mut diagnostic: Diagnostic) -> Self {
        let mut rest = diagnostic.take_next();
        let mut head = Self::single_diagnostic(diagnostic);
        while let Some(mut record) = rest {
            rest = record.take_next();
            head.append(Self::single_diagnostic(*record));
        }
        head
    }

    fn single_diagnostic(diagnostic: Diagnostic) -> Self {
        let kind = if diagnostic.code() < 0 {
            SqlErrorKind::Error
        } else {
            SqlErrorKind::Warning
        };
        let state = diagnostic.state().to_string();
        let code = diagnostic.code();
        Self::from_source(
            kind,
            MessageSource::Diagnostic(Box::new(diagnostic)),
            &state,
            code,
        )
    }

    /// Create an exception with a literal message
    pub fn text(kind: SqlErrorKind, message: impl Into<String>, state: &str, code: i32) -> Self {
        Self::from_source(kind, MessageSource::Text(message.into()), state, code)
    }

    /// Protocol or parse failure
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::client(MessageId::ProtocolError, [detail.into()])
    }

    /// Disconnect-class failure
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::client(MessageId::Disconnect, [reason.into()])
    }

    /// Security provider failure
    pub fn security(reason: impl fmt::Display) -> Self {
        Self::client(MessageId::SecurityExceptionEncountered, [reason.to_string()])
    }

    /// Non-atomic batch failure carrying the per-slot update counts
    pub fn batch_failure(update_counts: Vec<i64>, chain: Option<SqlException>) -> Self {
        let mut e = Self::client(MessageId::BatchNonAtomicFailure, Vec::<String>::new());
        e.kind = SqlErrorKind::BatchUpdate { update_counts };
        e.next = chain.map(Box::new);
        e
    }

    /// Attach the lower-level error that caused this one
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Append `next` (and its chain) to the end of this chain
    pub fn with_next(mut self, next: SqlException) -> Self {
        self.append(next);
        self
    }

    /// Append an exception chain at the tail of this one
    pub fn append(&mut self, other: SqlException) {
        match &mut self.next {
            Some(next) => next.append(other),
            None => self.next = Some(Box::new(other)),
        }
    }

    /// Kind of this exception
    pub fn kind(&self) -> &SqlErrorKind {
        &self.kind
    }

    /// SQLSTATE
    pub fn sql_state(&self) -> &str {
        &self.sql_state
    }

    /// Error code (server SQLCODE or client severity)
    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    /// Client message id, if the exception was raised locally
    pub fn message_id(&self) -> Option<MessageId> {
        match &self.source {
            MessageSource::Client { id, .. } => Some(*id),
            MessageSource::External(e) => e.message_id(),
            _ => None,
        }
    }

    /// Server diagnostic backing this exception
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match &self.source {
            MessageSource::Diagnostic(d) => Some(d),
            _ => None,
        }
    }

    /// Batch slot this exception was raised for
    pub fn batch_position(&self) -> Option<usize> {
        self.batch_position
    }

    /// Next exception in the chain
    pub fn next(&self) -> Option<&SqlException> {
        self.next.as_deref()
    }

    /// Lower-level cause, if any
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether this exception ends the session
    pub fn is_chain_breaking(&self) -> bool {
        self.kind == SqlErrorKind::Disconnect
    }

    /// Whether the server reported that the called routine does not exist
    pub fn is_procedure_not_found(&self) -> bool {
        self.sql_state == sql_state::PROCEDURE_NOT_FOUND
            || self.error_code == error_code::PROCEDURE_NOT_FOUND
    }

    /// Iterate over this exception and its successors
    pub fn iter(&self) -> SqlExceptionIter<'_> {
        SqlExceptionIter {
            current: Some(self),
        }
    }

    /// Label this exception and every successor with a batch slot
    pub(crate) fn label_batch(&mut self, index: usize) {
        self.batch_position = Some(index);
        if let Some(next) = self.next.as_mut() {
            next.label_batch(index);
        }
    }

    /// Resolve the message text of this single exception
    pub fn message(&self, formatter: &mut dyn MessageFormatter) -> String {
        let base = match &self.source {
            MessageSource::Diagnostic(d) => d.message(formatter),
            MessageSource::Client { id, args } => id.render(args),
            MessageSource::Text(text) => text.clone(),
            MessageSource::External(e) => e.message().to_string(),
        };
        match self.batch_position {
            Some(index) => format!("{}{}: {}", BATCH_POSITION_PREFIX, index, base),
            None => base,
        }
    }

    /// Rebuild this chain as a public [`SqlError`] chain, in the same order
    pub fn into_sql_error(self, formatter: &mut dyn MessageFormatter) -> SqlError {
        let mut nodes = Vec::new();
        let mut current = Some(self);
        while let Some(mut node) = current {
            current = node.next.take().map(|b| *b);
            nodes.push(node);
        }

        let mut tail: Option<SqlError> = None;
        for node in nodes.into_iter().rev() {
            let mut flat = node.flatten_one(formatter);
            if let Some(next) = tail.take() {
                flat.append(next);
            }
            tail = Some(flat);
        }
        // The loop runs at least once
        tail.unwrap_or_else(|| {
            SqlError::new(SqlErrorKind::Error, "", sql_state::PROTOCOL_ERROR, 0)
        })
    }

    /// Convert into the public error type
    pub fn into_error(self, formatter: &mut dyn MessageFormatter) -> Error {
        Error::Sql(Box::new(self.into_sql_error(formatter)))
    }

    fn flatten_one(self, formatter: &mut dyn MessageFormatter) -> SqlError {
        let message = match self.source {
            MessageSource::External(mut e) => {
                if let Some(index) = self.batch_position {
                    e.label_batch(index);
                }
                return *e;
            }
            _ => self.message(formatter),
        };
        let id = self.message_id();
        SqlError::new(self.kind, message, self.sql_state, self.error_code)
            .with_message_id(id)
            .with_cause(self.cause)
    }
}

impl fmt::Display for SqlException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message(&mut Unformatted))
    }
}

impl std::error::Error for SqlException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

impl From<SqlException> for Error {
    fn from(e: SqlException) -> Self {
        e.into_error(&mut Unformatted)
    }
}

impl From<Error> for SqlException {
    fn from(e: Error) -> Self {
        match e {
            Error::Sql(inner) => {
                let kind = inner.kind().clone();
                let state = inner.sql_state().to_string();
                let code = inner.error_code();
                Self::from_source(kind, MessageSource::External(inner), &state, code)
            }
            Error::Io(io) => SqlException::disconnect(io.to_string()).with_cause(io),
            Error::ConnectionTimeout(d) => {
                SqlException::disconnect(format!("connection timeout after {:?}", d))
            }
            Error::InvalidConnectionString(s) => SqlException::text(
                SqlErrorKind::Error,
                format!("invalid connection string: {}", s),
                sql_state::SECURITY_EXCEPTION,
                error_code::SESSION_SEVERITY,
            ),
        }
    }
}

/// Iterator over a [`SqlException`] chain
#[derive(Debug)]
pub struct SqlExceptionIter<'a> {
    current: Option<&'a SqlException>,
}

impl<'a> Iterator for SqlExceptionIter<'a> {
    type Item = &'a SqlException;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next();
        Some(current)
    }
}
