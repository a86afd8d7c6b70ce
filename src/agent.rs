//! Session core
//!
//! The [`Agent`] owns the transport of one physical connection together with
//! everything that has to stay consistent with the wire stream: the read
//! chain's [`ExceptionAccumulator`], the [`DeferredQueue`], the session
//! warnings, the statement cache, the security context and the transaction
//! identity used to validate locators.
//!
//! Every round trip is bracketed the same way:
//!
//! ```text
//! begin_write_chain -> write* -> flow -> read_reply* -> end_read_chain
//! ```
//!
//! `begin_write_chain` raises anything deferred, `flow` flushes the requests
//! and resets the accumulator, and `end_read_chain` raises whatever was
//! accumulated while the replies were read. A transport failure anywhere in
//! between closes the session and is raised immediately as a chain-breaking
//! disconnect.

use std::io;

use bytes::Bytes;

use crate::accumulator::{DeferredQueue, ExceptionAccumulator};
use crate::constants::{sql_state, SUCCESS_NO_INFO};
use crate::crypto::EncryptionManager;
use crate::diagnostic::{Diagnostic, MessageFormatter, Unformatted};
use crate::error::{Error, SqlError};
use crate::exception::{MessageId, SqlException, SqlResult};
use crate::locator::LocatorSupport;
use crate::messages::{Reply, Request};
use crate::statement::{CallResults, CallableStatement};
use crate::statement_cache::StatementCache;
use crate::transport::Transport;
use crate::types::{SqlType, Value};

/// Server message formatting procedure
pub const SQLCAMESSAGE_SQL: &str =
    "CALL SYSIBM.SQLCAMESSAGE(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Output parameter holding the formatted message
const MESSAGE_OUT_INDEX: usize = 15;

/// Output parameter holding the procedure return code
const RETURN_CODE_OUT_INDEX: usize = 16;

/// Session options that affect the agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Ask the server to format diagnostic messages
    pub retrieve_message_text: bool,
    /// Locale passed to the message formatting procedure
    pub locale: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            retrieve_message_text: true,
            locale: "en_US".to_string(),
        }
    }
}

/// Attributes reported by the server during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server name (SRVNAM)
    pub server_name: String,
    /// Product release level (SRVRLSLV)
    pub product_release: String,
}

/// Per-connection session state
pub struct Agent {
    transport: Box<dyn Transport>,
    settings: AgentSettings,
    accumulator: ExceptionAccumulator,
    deferred: DeferredQueue,
    /// Warnings not yet rendered
    pending_warnings: Option<SqlException>,
    /// Warnings already rendered for the caller
    warnings: Option<SqlError>,
    statements: StatementCache,
    pub(crate) locator_support: LocatorSupport,
    pub(crate) encryption: EncryptionManager,
    pub(crate) server: ServerInfo,
    transaction_id: u64,
    closed: bool,
    formatting: bool,
}

impl Agent {
    /// Create an agent over an open transport
    pub fn new(transport: Box<dyn Transport>, settings: AgentSettings) -> Self {
        Self {
            transport,
            settings,
            accumulator: ExceptionAccumulator::new(),
            deferred: DeferredQueue::new(),
            pending_warnings: None,
            warnings: None,
            statements: StatementCache::new(),
            locator_support: LocatorSupport::default(),
            encryption: EncryptionManager::new(),
            server: ServerInfo::default(),
            transaction_id: 1,
            closed: false,
            formatting: false,
        }
    }

    /// Whether the session has been closed or lost
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Identity of the current unit of work
    ///
    /// Changes on every commit, rollback and disconnect.
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Session settings
    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    // =========================================================================
    // Chain brackets
    // =========================================================================

    /// Start a write chain
    ///
    /// Raises the deferred exception chain, if any, before anything is sent.
    pub(crate) fn begin_write_chain(&mut self) -> SqlResult<()> {
        tracing::trace!("begin_write_chain");
        self.deferred.check()?;
        if self.closed {
            return Err(SqlException::client(
                MessageId::NoCurrentConnection,
                Vec::<String>::new(),
            ));
        }
        Ok(())
    }

    /// Queue a request in the current write chain
    pub(crate) fn write(&mut self, request: &Request) -> SqlResult<()> {
        tracing::trace!(request = ?request.code_point(), "write");
        match self.transport.send(request) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.disconnect_with(e)),
        }
    }

    /// Send the write chain and start reading its replies
    pub(crate) fn flow(&mut self) -> SqlResult<()> {
        if let Err(e) = self.transport.flush() {
            return Err(self.disconnect_with(e));
        }
        self.begin_read_chain();
        Ok(())
    }

    /// Start a read chain
    pub(crate) fn begin_read_chain(&mut self) {
        tracing::trace!("begin_read_chain");
        self.accumulator.reset();
    }

    /// Read the next reply of the current read chain
    pub(crate) fn read_reply(&mut self) -> SqlResult<Reply> {
        match self.transport.receive() {
            Ok(reply) => {
                tracing::trace!(reply = reply.name(), "read");
                Ok(reply)
            }
            Err(e) => Err(self.disconnect_with(e)),
        }
    }

    /// End the read chain, raising anything accumulated while reading
    pub(crate) fn end_read_chain(&mut self) -> SqlResult<()> {
        tracing::trace!("end_read_chain");
        self.accumulator.check_for_accumulated()
    }

    /// Record an exception found while reading replies
    pub(crate) fn accumulate(&mut self, exception: SqlException) {
        self.accumulator.accumulate(exception);
    }

    /// End the session because of a protocol-level failure
    ///
    /// The returned chain leads with the disconnect and must be raised.
    pub(crate) fn chain_breaking(&mut self, exception: SqlException) -> SqlException {
        self.mark_disconnected();
        self.accumulator.accumulate_chain_breaking(exception)
    }

    fn disconnect_with(&mut self, error: io::Error) -> SqlException {
        tracing::warn!(error = %error, "Transport failure, closing session");
        let exception = SqlException::disconnect(error.to_string()).with_cause(error);
        self.chain_breaking(exception)
    }

    fn mark_disconnected(&mut self) {
        if let Err(e) = self.transport.close() {
            tracing::debug!(error = %e, "Error closing transport after disconnect");
        }
        self.closed = true;
        self.deferred.clear();
        self.transaction_id += 1;
    }

    // =========================================================================
    // Reply processing
    // =========================================================================

    /// Interpret the SQLCA of a reply
    ///
    /// Errors are accumulated, warnings are added to the session warnings.
    /// Returns the update count the diagnostic carries.
    pub(crate) fn process_sqlcard(&mut self, sqlcard: Option<&Bytes>) -> i64 {
        let data = match sqlcard {
            Some(data) => data,
            None => return 0,
        };
        let diagnostic = match Diagnostic::from_wire(data) {
            Ok(d) => d,
            Err(e) => {
                self.accumulate(e);
                return SUCCESS_NO_INFO;
            }
        };
        let count = diagnostic.update_count() as i64;
        if diagnostic.is_error() {
            tracing::debug!(
                sqlcode = diagnostic.code(),
                sqlstate = diagnostic.state(),
                "Server reported error"
            );
            self.accumulate(SqlException::from_diagnostic(diagnostic));
        } else if diagnostic.is_warning() {
            self.add_warning(SqlException::from_diagnostic(diagnostic));
        }
        count
    }

    /// Read an SQL reply into call results
    fn read_sql_reply(&mut self) -> SqlResult<CallResults> {
        match self.read_reply()? {
            Reply::Sql { sqlcard, values } => {
                let count = self.process_sqlcard(sqlcard.as_ref());
                Ok(CallResults::new(count, values))
            }
            other => {
                self.accumulate(unexpected_reply(&other));
                Ok(CallResults::default())
            }
        }
    }

    // =========================================================================
    // Warnings
    // =========================================================================

    /// Add a warning to the session warning chain
    pub(crate) fn add_warning(&mut self, warning: SqlException) {
        tracing::debug!(sql_state = warning.sql_state(), "Session warning");
        match self.pending_warnings.as_mut() {
            Some(head) => head.append(warning),
            None => self.pending_warnings = Some(warning),
        }
    }

    /// Session warnings, oldest first
    pub fn warnings(&mut self) -> Option<SqlError> {
        if let Some(pending) = self.pending_warnings.take() {
            let rendered = pending.into_sql_error(self);
            self.push_rendered(rendered);
            // Warnings raised while formatting the ones above
            if let Some(late) = self.pending_warnings.take() {
                let rendered = late.into_sql_error(&mut Unformatted);
                self.push_rendered(rendered);
            }
        }
        self.warnings.clone()
    }

    fn push_rendered(&mut self, rendered: SqlError) {
        match self.warnings.as_mut() {
            Some(head) => head.append(rendered),
            None => self.warnings = Some(rendered),
        }
    }

    /// Drop every session warning
    pub fn clear_warnings(&mut self) {
        self.pending_warnings = None;
        self.warnings = None;
    }

    /// Convert an internal exception into the public error type
    ///
    /// Messages are formatted through this session when it allows it.
    pub fn surface(&mut self, exception: SqlException) -> Error {
        exception.into_error(self)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Prepare (once) and execute `sql`
    ///
    /// `bind` sets inputs and registers outputs on the cached statement.
    pub(crate) fn call<F>(&mut self, sql: &str, bind: F) -> SqlResult<CallResults>
    where
        F: FnOnce(&mut CallableStatement) -> SqlResult<()>,
    {
        let (mut statement, epoch) = self.checkout_statement(sql);
        let bound = bind(&mut statement);
        self.execute_bound(statement, epoch, bound)
    }

    /// Take the statement for `sql` out of the cache for binding
    pub(crate) fn checkout_statement(&mut self, sql: &str) -> (CallableStatement, u64) {
        (self.statements.checkout(sql), self.statements.epoch())
    }

    /// Execute a statement bound outside the session and return it to the cache
    ///
    /// A failed bind is returned without touching the server. When the cache
    /// was cleared since the checkout, the statement moves to a section of the
    /// current session and is prepared again.
    pub(crate) fn execute_bound(
        &mut self,
        mut statement: CallableStatement,
        epoch: u64,
        bound: SqlResult<()>,
    ) -> SqlResult<CallResults> {
        if epoch != self.statements.epoch() {
            let current = self.statements.checkout(statement.sql());
            tracing::trace!(
                sql = statement.sql(),
                section = current.section(),
                "Statement outlived a cache reset"
            );
            statement.rebase(current.section());
        }
        let result = match bound {
            Ok(()) => self.execute_statement(&mut statement),
            Err(e) => Err(e),
        };
        self.statements.checkin(statement);
        result
    }

    fn prepare_statement(&mut self, statement: &mut CallableStatement) -> SqlResult<()> {
        if statement.is_prepared() {
            return Ok(());
        }
        tracing::trace!(sql = statement.sql(), section = statement.section(), "prepare");
        self.begin_write_chain()?;
        self.write(&Request::Prepare {
            section: statement.section(),
            sql: statement.sql().to_string(),
        })?;
        self.flow()?;
        self.read_sql_reply()?;
        self.end_read_chain()?;
        statement.mark_prepared();
        Ok(())
    }

    fn execute_statement(&mut self, statement: &mut CallableStatement) -> SqlResult<CallResults> {
        self.prepare_statement(statement)?;
        tracing::trace!(sql = statement.sql(), section = statement.section(), "execute");
        self.begin_write_chain()?;
        self.write(&Request::Execute {
            section: statement.section(),
            params: statement.parameters().to_vec(),
            outputs: statement.out_types().to_vec(),
        })?;
        self.flow()?;
        let results = self.read_sql_reply()?;
        self.end_read_chain()?;
        Ok(results)
    }

    /// Execute `sql` once per row in a single chain
    ///
    /// Returns one update count per row. Failures of individual rows are
    /// reported together as a non-atomic batch failure. A disconnect is
    /// raised as the disconnect chain itself.
    pub(crate) fn execute_batch(&mut self, sql: &str, rows: &[Vec<Value>]) -> SqlResult<Vec<i64>> {
        let mut statement = self.statements.checkout(sql);
        let result = self.execute_batch_statement(&mut statement, rows);
        self.statements.checkin(statement);
        result
    }

    fn execute_batch_statement(
        &mut self,
        statement: &mut CallableStatement,
        rows: &[Vec<Value>],
    ) -> SqlResult<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let expected = statement.parameter_count();
        if let Some(row) = rows.iter().find(|r| r.len() != expected) {
            return Err(SqlException::client(
                MessageId::InvalidApiParameter,
                [row.len().to_string(), "batch row length".to_string()],
            ));
        }

        self.prepare_statement(statement)?;
        tracing::debug!(sql = statement.sql(), rows = rows.len(), "execute batch");
        self.begin_write_chain()?;
        for row in rows {
            self.write(&Request::Execute {
                section: statement.section(),
                params: row.clone(),
                outputs: vec![None; expected],
            })?;
        }
        self.flow()?;

        self.accumulator.begin_batch(rows.len());
        let mut counts = vec![SUCCESS_NO_INFO; rows.len()];
        for (index, count) in counts.iter_mut().enumerate() {
            self.accumulator.set_batch_index(index);
            let reply = match self.read_reply() {
                Ok(reply) => reply,
                Err(e) => {
                    self.accumulator.cancel_batch();
                    return Err(e);
                }
            };
            match reply {
                Reply::Sql { sqlcard, .. } => *count = self.process_sqlcard(sqlcard.as_ref()),
                other => self.accumulate(unexpected_reply(&other)),
            }
        }
        self.accumulator.end_batch(&mut counts, None)?;
        Ok(counts)
    }

    /// Commit or roll back the current unit of work
    pub(crate) fn end_unit_of_work(&mut self, commit: bool) -> SqlResult<()> {
        tracing::debug!(commit = commit, transaction = self.transaction_id, "end unit of work");
        let request = if commit {
            Request::Commit
        } else {
            Request::Rollback
        };
        self.begin_write_chain()?;
        self.write(&request)?;
        self.flow()?;
        match self.read_reply()? {
            Reply::EndUnitOfWork { sqlcard } | Reply::Sql { sqlcard, .. } => {
                self.process_sqlcard(sqlcard.as_ref());
            }
            other => self.accumulate(unexpected_reply(&other)),
        }
        self.end_read_chain()?;
        self.transaction_id += 1;
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the session
    ///
    /// Idempotent. Pending deferred exceptions are dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!("Closing session");
        self.mark_disconnected();
        self.statements.clear();
    }

    /// Forget everything negotiated with the server
    ///
    /// Used before re-running the handshake on the same transport.
    pub(crate) fn reset(&mut self) {
        tracing::debug!("Resetting session state");
        self.encryption.reset();
        self.statements.clear();
        self.locator_support = LocatorSupport::default();
        self.deferred.clear();
        self.accumulator.reset();
        self.clear_warnings();
        self.transaction_id += 1;
    }

    /// Reopen a closed session over a new transport
    pub(crate) fn replace_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = transport;
        self.closed = false;
    }

    // =========================================================================
    // Message formatting
    // =========================================================================

    fn call_message_procedure(&mut self, diagnostic: &Diagnostic) -> SqlResult<Option<String>> {
        let locale = self.settings.locale.clone();
        let tokens = diagnostic.token_string();
        let results = self.call(SQLCAMESSAGE_SQL, |stmt| {
            stmt.set_int(1, diagnostic.code())?;
            stmt.set_short(2, tokens.len().min(i16::MAX as usize) as i16)?;
            stmt.set_string(3, &tokens)?;
            stmt.set_string(4, diagnostic.product_id().unwrap_or(""))?;
            for (i, value) in diagnostic.errd().iter().enumerate() {
                stmt.set_int(5 + i, *value)?;
            }
            stmt.set_string(11, &diagnostic.warning_flags())?;
            stmt.set_string(12, diagnostic.state())?;
            stmt.set_string(13, "")?;
            stmt.set_string(14, &locale)?;
            stmt.register_out_parameter(MESSAGE_OUT_INDEX, SqlType::Varchar)?;
            stmt.register_out_parameter(RETURN_CODE_OUT_INDEX, SqlType::Integer)
        })?;

        let return_code = results.get_int(RETURN_CODE_OUT_INDEX)?;
        if return_code != 0 {
            tracing::debug!(return_code = return_code, "Message procedure returned non-zero");
            return Ok(None);
        }
        results.get_string(MESSAGE_OUT_INDEX)
    }
}

impl MessageFormatter for Agent {
    fn can_format(&self) -> bool {
        !self.closed && self.settings.retrieve_message_text && !self.formatting
    }

    fn format(&mut self, diagnostic: &Diagnostic) -> SqlResult<Option<String>> {
        self.formatting = true;
        let result = self.call_message_procedure(diagnostic);
        self.formatting = false;
        result
    }

    fn warn(&mut self, warning: SqlException) {
        self.add_warning(warning);
    }

    fn defer(&mut self, exception: SqlException) {
        self.deferred.push(exception);
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("server", &self.server)
            .field("transaction_id", &self.transaction_id)
            .field("closed", &self.closed)
            .field("statements", &self.statements.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

pub(crate) fn unexpected_reply(reply: &Reply) -> SqlException {
    SqlException::protocol(format!("unexpected reply {}", reply.name()))
}

/// Whether `e` says the server has no such routine
pub(crate) fn is_missing_routine(e: &SqlException) -> bool {
    e.iter().any(SqlException::is_procedure_not_found)
}

/// Whether `e` reports a server-side invalid locator
pub(crate) fn is_invalid_locator(e: &SqlException) -> bool {
    e.iter().any(|x| x.sql_state() == sql_state::INVALID_LOCATOR)
}
