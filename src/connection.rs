//! DRDA database connection
//!
//! This module provides the main `Connection` type. A connection owns one
//! [`Agent`] behind a mutex; clones share it, which is how large objects keep
//! a handle on the session that created them.
//!
//! # Example
//!
//! ```rust,no_run
//! use drda_client::{Connection, Value};
//!
//! fn main() -> drda_client::Result<()> {
//!     let conn = Connection::connect_str("localhost:1527/sample", "app", "secret")?;
//!
//!     conn.execute("INSERT INTO logs (msg) VALUES (?)", &[Value::from("hello")])?;
//!     conn.commit()?;
//!
//!     let mut blob = conn.create_blob()?;
//!     blob.set_bytes(1, b"payload")?;
//!     assert_eq!(blob.length()?, 7);
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{unexpected_reply, Agent, ServerInfo};
use crate::batch::{BatchBinds, BatchResult};
use crate::config::{Config, SecurityMechanism};
use crate::constants::INVALID_LOCATOR;
use crate::crypto::{generate_seed, SEED_LENGTH};
use crate::diagnostic::MessageFormatter;
use crate::error::{Error, Result, SqlError};
use crate::exception::{MessageId, SqlException, SqlResult};
use crate::locator::{LobFamily, LocatorProcedures};
use crate::messages::{Credentials, Reply, Request};
use crate::statement::{CallResults, CallableStatement};
use crate::trace::mask;
use crate::transport::{TcpTransport, Transport};
use crate::types::{Blob, Clob, Value};

/// Product identifier sent in ACCRDB
pub const PRODUCT_ID: &str = "DNC10170";

/// External name sent in EXCSAT
const EXTERNAL_NAME: &str = "drda-client";

/// A connection to a DRDA server
///
/// # Thread Safety
///
/// `Connection` is `Send` and `Sync`, but operations are serialized
/// internally via a mutex. Cloning a connection yields another handle to the
/// same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<Agent>>,
    config: Arc<Config>,
    id: u32,
}

// Connection ID counter
static CONNECTION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

impl Connection {
    /// Connect using a `host[:port]/database` string
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use drda_client::Connection;
    /// let conn = Connection::connect_str("localhost:1527/sample", "app", "secret")?;
    /// # Ok::<(), drda_client::Error>(())
    /// ```
    pub fn connect_str(connect_string: &str, username: &str, password: &str) -> Result<Self> {
        let mut config: Config = connect_string.parse()?;
        config.set_username(username);
        config.set_password(password);
        Self::connect(config)
    }

    /// Open a TCP connection and run the handshake
    pub fn connect(config: Config) -> Result<Self> {
        let transport = open_tcp(&config)?;
        Self::connect_with_transport(config, Box::new(transport))
    }

    /// Run the handshake over an already open transport
    pub fn connect_with_transport(config: Config, transport: Box<dyn Transport>) -> Result<Self> {
        let id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut agent = Agent::new(transport, config.agent_settings());

        if let Err(e) = handshake(&mut agent, &config) {
            tracing::debug!(connection = id, sql_state = e.sql_state(), "Handshake failed");
            agent.close();
            return Err(agent.surface(e));
        }
        tracing::debug!(
            connection = id,
            server = %agent.server.server_name,
            release = %agent.server.product_release,
            "Connected"
        );

        Ok(Connection {
            inner: Arc::new(Mutex::new(agent)),
            config: Arc::new(config),
            id,
        })
    }

    /// Get the connection ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Configuration the connection was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check if the connection is closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }

    /// Identity of the current unit of work
    pub fn transaction_id(&self) -> u64 {
        self.inner.lock().transaction_id()
    }

    /// Get server information
    pub fn server_info(&self) -> ServerInfo {
        self.inner.lock().server.clone()
    }

    /// Commit the current transaction
    ///
    /// Locator-backed LOBs created in the transaction become invalid.
    pub fn commit(&self) -> Result<()> {
        self.run(|agent| agent.end_unit_of_work(true))
    }

    /// Roll back the current transaction
    pub fn rollback(&self) -> Result<()> {
        self.run(|agent| agent.end_unit_of_work(false))
    }

    /// Execute a statement with positional input values
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<CallResults> {
        self.run(|agent| {
            agent.call(sql, |stmt| {
                for (i, value) in params.iter().enumerate() {
                    stmt.set_value(i + 1, value.clone())?;
                }
                Ok(())
            })
        })
    }

    /// Execute a statement, binding inputs and registering outputs in `bind`
    ///
    /// `bind` runs while the session is unlocked, so it may read or drop LOBs
    /// of this connection.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use drda_client::{Connection, SqlType};
    /// # fn example(conn: Connection) -> drda_client::Result<()> {
    /// let results = conn.call("? = CALL APP.NEXT_ID(?)", |stmt| {
    ///     stmt.register_out_parameter(1, SqlType::BigInt)?;
    ///     stmt.set_string(2, "orders")
    /// })?;
    /// let next = results.get_long(1)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn call<F>(&self, sql: &str, bind: F) -> Result<CallResults>
    where
        F: FnOnce(&mut CallableStatement) -> SqlResult<()>,
    {
        let (mut statement, epoch) = self.inner.lock().checkout_statement(sql);
        let bound = bind(&mut statement);
        self.run(|agent| agent.execute_bound(statement, epoch, bound))
    }

    /// Execute a statement once per row of `batch`, in one round trip
    ///
    /// If any row fails, the error is a batch update failure whose
    /// `update_counts` marks the failed rows with
    /// [`EXECUTE_FAILED`](crate::constants::EXECUTE_FAILED) and whose chain
    /// holds one labeled error per failure.
    pub fn execute_batch(&self, batch: &BatchBinds) -> Result<BatchResult> {
        batch.check_shape()?;
        let counts = self.run(|agent| agent.execute_batch(batch.sql(), batch.rows()))?;
        Ok(BatchResult::new(counts))
    }

    /// Create an empty BLOB
    ///
    /// The value lives on the server behind a locator when the server has
    /// the locator procedures, and in memory otherwise.
    pub fn create_blob(&self) -> Result<Blob> {
        let locator = self.with_locator(|procs| procs.create_locator(LobFamily::Blob))?;
        if locator == INVALID_LOCATOR {
            Ok(Blob::attached(self.clone(), Vec::new()))
        } else {
            Ok(Blob::from_locator(self.clone(), locator, Some(0)))
        }
    }

    /// Create an empty CLOB
    pub fn create_clob(&self) -> Result<Clob> {
        let locator = self.with_locator(|procs| procs.create_locator(LobFamily::Clob))?;
        if locator == INVALID_LOCATOR {
            Ok(Clob::attached(self.clone(), String::new()))
        } else {
            Ok(Clob::from_locator(self.clone(), locator, Some(0)))
        }
    }

    /// Wrap a BLOB locator returned by a statement
    pub fn blob_from_locator(&self, locator: i32) -> Blob {
        Blob::from_locator(self.clone(), locator, None)
    }

    /// Wrap a CLOB locator returned by a statement
    pub fn clob_from_locator(&self, locator: i32) -> Clob {
        Clob::from_locator(self.clone(), locator, None)
    }

    /// Warnings reported on this session, oldest first
    pub fn warnings(&self) -> Option<SqlError> {
        self.inner.lock().warnings()
    }

    /// Drop every session warning
    pub fn clear_warnings(&self) {
        self.inner.lock().clear_warnings();
    }

    /// Close the connection
    ///
    /// Idempotent. Every LOB of this connection becomes invalid.
    pub fn close(&self) {
        tracing::debug!(connection = self.id, "Closing connection");
        self.inner.lock().close();
    }

    /// Reset the session and authenticate again
    ///
    /// The security context, statement cache, locator support and warnings
    /// are cleared. A closed connection is reopened over TCP first.
    pub fn reset(&self) -> Result<()> {
        let mut agent = self.inner.lock();
        if agent.is_closed() {
            agent.replace_transport(Box::new(open_tcp(&self.config)?));
        }
        self.rehandshake(&mut agent)
    }

    /// Reset the session over a new transport
    pub fn reset_with_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut agent = self.inner.lock();
        agent.replace_transport(transport);
        self.rehandshake(&mut agent)
    }

    fn rehandshake(&self, agent: &mut Agent) -> Result<()> {
        tracing::debug!(connection = self.id, "Resetting connection");
        agent.reset();
        if let Err(e) = handshake(agent, &self.config) {
            agent.close();
            return Err(agent.surface(e));
        }
        Ok(())
    }

    // =========================================================================
    // Crate-internal helpers
    // =========================================================================

    /// Run `f` on the session, surfacing its failure
    fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Agent) -> SqlResult<T>,
    {
        let mut agent = self.inner.lock();
        match f(&mut agent) {
            Ok(value) => Ok(value),
            Err(e) => Err(agent.surface(e)),
        }
    }

    /// Run locator procedure calls on this session
    pub(crate) fn with_locator<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LocatorProcedures<'_>) -> SqlResult<T>,
    {
        self.run(|agent| f(&mut LocatorProcedures::new(agent)))
    }

    /// Release a locator from `Drop`
    ///
    /// A failure is deferred to the next call on this session.
    pub(crate) fn release_deferred(&self, family: LobFamily, locator: i32) {
        let mut agent = self.inner.lock();
        if agent.is_closed() {
            return;
        }
        let result = LocatorProcedures::new(&mut agent).release_locator(family, locator);
        if let Err(e) = result {
            tracing::debug!(
                locator = locator,
                sql_state = e.sql_state(),
                "Deferring locator release failure"
            );
            agent.defer(e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

fn open_tcp(config: &Config) -> Result<TcpTransport> {
    TcpTransport::connect(&config.host, config.port, config.connect_timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::ConnectionTimeout(config.connect_timeout)
        } else {
            Error::Io(e)
        }
    })
}

// =============================================================================
// Handshake
// =============================================================================

/// EXCSAT, ACCSEC, SECCHK and ACCRDB, each in its own round trip
fn handshake(agent: &mut Agent, config: &Config) -> SqlResult<()> {
    let mechanism = config.effective_security_mechanism();
    tracing::debug!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        user = %config.username,
        password = %mask(config.password()),
        mechanism = ?mechanism,
        "Connecting"
    );

    exchange_server_attributes(agent)?;
    let client_seed = generate_seed();
    let server_token = access_security(agent, config, mechanism, &client_seed)?;
    let credentials = credentials(agent, config, mechanism, &client_seed, &server_token)?;
    security_check(agent, config, credentials)?;
    access_rdb(agent, config)
}

fn exchange_server_attributes(agent: &mut Agent) -> SqlResult<()> {
    agent.begin_write_chain()?;
    agent.write(&Request::ExchangeServerAttributes {
        external_name: EXTERNAL_NAME.to_string(),
        server_name: String::new(),
        product_release: env!("CARGO_PKG_VERSION").to_string(),
    })?;
    agent.flow()?;
    match agent.read_reply()? {
        Reply::ServerAttributes {
            server_name,
            product_release,
        } => {
            agent.server = ServerInfo {
                server_name,
                product_release,
            };
        }
        other => agent.accumulate(unexpected_reply(&other)),
    }
    agent.end_read_chain()
}

/// Propose the security mechanism; returns the server token
fn access_security(
    agent: &mut Agent,
    config: &Config,
    mechanism: SecurityMechanism,
    client_seed: &[u8; SEED_LENGTH],
) -> SqlResult<Vec<u8>> {
    let code = mechanism.code();
    let token = match mechanism {
        SecurityMechanism::EncryptedPassword | SecurityMechanism::EncryptedUserIdPassword => {
            Some(agent.encryption.public_key_bytes().to_vec())
        }
        SecurityMechanism::StrongPasswordSubstitute => Some(client_seed.to_vec()),
        SecurityMechanism::UserIdPassword | SecurityMechanism::UserIdOnly => None,
    };
    let needs_token = token.is_some();

    agent.begin_write_chain()?;
    agent.write(&Request::AccessSecurity {
        mechanism: code,
        rdb_name: config.database.clone(),
        token,
    })?;
    agent.flow()?;
    let server_token = match agent.read_reply()? {
        Reply::SecurityAccepted { mechanisms, token } => {
            if !mechanisms.contains(&code) {
                agent.accumulate(SqlException::client(
                    MessageId::AuthenticationFailed,
                    [format!(
                        "security mechanism {} is not supported by the server (supported: {:?})",
                        code, mechanisms
                    )],
                ));
            }
            token
        }
        other => {
            agent.accumulate(unexpected_reply(&other));
            None
        }
    };
    agent.end_read_chain()?;

    match server_token {
        Some(token) => Ok(token),
        None if needs_token => Err(agent.chain_breaking(SqlException::disconnect(
            "server did not send a security token",
        ))),
        None => Ok(Vec::new()),
    }
}

fn credentials(
    agent: &mut Agent,
    config: &Config,
    mechanism: SecurityMechanism,
    client_seed: &[u8; SEED_LENGTH],
    server_token: &[u8],
) -> SqlResult<Credentials> {
    let code = mechanism.code();
    let user = config.username.clone();
    let password = config.password();
    let credentials = match mechanism {
        SecurityMechanism::UserIdPassword => Credentials::UserPassword {
            user,
            password: password.to_string(),
        },
        SecurityMechanism::UserIdOnly => Credentials::UserOnly { user },
        SecurityMechanism::EncryptedPassword => {
            let encrypted =
                agent
                    .encryption
                    .encrypt(password.as_bytes(), code, user.as_bytes(), server_token)?;
            Credentials::EncryptedPassword {
                user,
                password: encrypted,
            }
        }
        SecurityMechanism::StrongPasswordSubstitute => {
            let substitute =
                agent
                    .encryption
                    .substitute_password(&user, password, client_seed, server_token)?;
            Credentials::PasswordSubstitute {
                user,
                substitute: substitute.to_vec(),
            }
        }
        SecurityMechanism::EncryptedUserIdPassword => {
            let encrypted_user =
                agent
                    .encryption
                    .encrypt(user.as_bytes(), code, server_token, server_token)?;
            let encrypted_password =
                agent
                    .encryption
                    .encrypt(password.as_bytes(), code, server_token, server_token)?;
            Credentials::EncryptedUserPassword {
                user: encrypted_user,
                password: encrypted_password,
            }
        }
    };
    Ok(credentials)
}

fn security_check(agent: &mut Agent, config: &Config, credentials: Credentials) -> SqlResult<()> {
    tracing::trace!(credentials = ?credentials, "SECCHK");
    agent.begin_write_chain()?;
    agent.write(&Request::SecurityCheck {
        rdb_name: config.database.clone(),
        credentials,
    })?;
    agent.flow()?;
    match agent.read_reply()? {
        Reply::SecurityChecked {
            check_code,
            sqlcard,
        } => {
            if check_code != 0 {
                agent.accumulate(SqlException::client(
                    MessageId::AuthenticationFailed,
                    [format!("security check code 0x{:02X}", check_code)],
                ));
            }
            agent.process_sqlcard(sqlcard.as_ref());
        }
        other => agent.accumulate(unexpected_reply(&other)),
    }
    agent.end_read_chain()
}

fn access_rdb(agent: &mut Agent, config: &Config) -> SqlResult<()> {
    agent.begin_write_chain()?;
    agent.write(&Request::AccessRdb {
        rdb_name: config.database.clone(),
        product_id: PRODUCT_ID.to_string(),
    })?;
    agent.flow()?;
    match agent.read_reply()? {
        Reply::RdbAccessed { sqlcard } => {
            agent.process_sqlcard(sqlcard.as_ref());
        }
        other => agent.accumulate(unexpected_reply(&other)),
    }
    agent.end_read_chain()
}
