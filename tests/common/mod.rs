//! In-memory DRDA server for integration tests
//!
//! [`FakeTransport`] answers requests the way a Derby-compatible network
//! server would: the four-step handshake with real credential checks, the
//! `SYSIBM` locator procedures over an in-memory LOB store, the
//! `SQLCAMESSAGE` formatting procedure, commit and rollback. Application
//! statements answer with an update count unless a scripted response is set.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use drda_client::constants::secmec;
use drda_client::crypto::{EncryptionManager, SEED_LENGTH};
use drda_client::messages::{Credentials, Reply, Request};
use drda_client::{Config, Connection, Diagnostic, SecurityMechanism, Transport, Value};

pub const USER: &str = "app";
pub const PASSWORD: &str = "secret";
pub const DATABASE: &str = "testdb";
pub const SERVER_NAME: &str = "FakeServer";
pub const SERVER_RELEASE: &str = "CSS10170";

const SERVER_SEED: [u8; SEED_LENGTH] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

/// Scripted answer for an application statement
#[derive(Debug, Clone)]
pub enum Response {
    Count(i32),
    Error(i32, &'static str, Vec<String>),
    Warning(i32, &'static str, Vec<String>),
    Values(Vec<Value>),
}

/// Everything the fake server knows and remembers
pub struct ServerState {
    pub user: String,
    pub password: String,
    pub database: String,
    pub mechanisms: Vec<u16>,
    /// Send no security token even when the mechanism needs one
    pub withhold_token: bool,
    /// SQL texts containing any of these fail to prepare with 42Y03
    pub missing_procedures: Vec<&'static str>,
    /// Scripted responses by exact SQL text
    pub responses: HashMap<String, Response>,
    /// Batch rows whose first parameter is one of these fail with 23505
    pub failing_rows: Vec<i32>,
    /// Replies still delivered before the connection drops
    pub break_after_replies: Option<usize>,
    /// The next commit fails with this SQLCODE and SQLSTATE
    pub failing_commit: Option<(i32, &'static str)>,

    pub blobs: HashMap<i32, Vec<u8>>,
    pub clobs: HashMap<i32, Vec<char>>,
    next_locator: i32,

    sections: HashMap<u16, String>,
    /// Every request, by command name, in arrival order
    pub requests: Vec<&'static str>,
    pub prepared: Vec<String>,
    pub executed: Vec<String>,
    pub released: Vec<i32>,
    pub flushes: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
    pub credentials: Option<Credentials>,
    pub authenticated: Option<String>,

    server_keys: Option<EncryptionManager>,
    client_token: Vec<u8>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            user: USER.to_string(),
            password: PASSWORD.to_string(),
            database: DATABASE.to_string(),
            mechanisms: vec![
                secmec::USRIDPWD,
                secmec::USRIDONL,
                secmec::USRENCPWD,
                secmec::USRSSBPWD,
                secmec::EUSRIDPWD,
            ],
            withhold_token: false,
            missing_procedures: Vec::new(),
            responses: HashMap::new(),
            failing_rows: Vec::new(),
            break_after_replies: None,
            failing_commit: None,
            blobs: HashMap::new(),
            clobs: HashMap::new(),
            next_locator: 1,
            sections: HashMap::new(),
            requests: Vec::new(),
            prepared: Vec::new(),
            executed: Vec::new(),
            released: Vec::new(),
            flushes: 0,
            commits: 0,
            rollbacks: 0,
            closes: 0,
            credentials: None,
            authenticated: None,
            server_keys: None,
            client_token: Vec::new(),
        }
    }

    /// Executions whose SQL contains `needle`
    pub fn executions(&self, needle: &str) -> usize {
        self.executed.iter().filter(|s| s.contains(needle)).count()
    }

    /// Prepares whose SQL contains `needle`
    pub fn prepares(&self, needle: &str) -> usize {
        self.prepared.iter().filter(|s| s.contains(needle)).count()
    }

    /// Replace the value behind a BLOB locator
    pub fn put_blob(&mut self, data: Vec<u8>) -> i32 {
        let id = self.allocate();
        self.blobs.insert(id, data);
        id
    }

    /// Replace the value behind a CLOB locator
    pub fn put_clob(&mut self, text: &str) -> i32 {
        let id = self.allocate();
        self.clobs.insert(id, text.chars().collect());
        id
    }

    fn allocate(&mut self) -> i32 {
        let id = self.next_locator;
        self.next_locator += 1;
        id
    }

    fn process(&mut self, request: &Request) -> Reply {
        self.requests.push(request_name(request));
        match request {
            Request::ExchangeServerAttributes { .. } => Reply::ServerAttributes {
                server_name: SERVER_NAME.to_string(),
                product_release: SERVER_RELEASE.to_string(),
            },
            Request::AccessSecurity {
                mechanism, token, ..
            } => self.access_security(*mechanism, token.clone()),
            Request::SecurityCheck { credentials, .. } => self.security_check(credentials),
            Request::AccessRdb { rdb_name, .. } => {
                if *rdb_name == self.database {
                    Reply::RdbAccessed { sqlcard: None }
                } else {
                    Reply::RdbAccessed {
                        sqlcard: Some(
                            Diagnostic::new(-4499, "08004")
                                .with_tokens(&[rdb_name.as_str()])
                                .to_wire(),
                        ),
                    }
                }
            }
            Request::Prepare { section, sql } => {
                self.prepared.push(sql.clone());
                if self.missing_procedures.iter().any(|p| sql.contains(p)) {
                    return error(-440, "42Y03", &[sql.as_str()]);
                }
                self.sections.insert(*section, sql.clone());
                Reply::sql(None)
            }
            Request::Execute {
                section, params, ..
            } => match self.sections.get(section).cloned() {
                Some(sql) => {
                    self.executed.push(sql.clone());
                    self.execute(&sql, params)
                }
                None => error::<&str>(-501, "24501", &[]),
            },
            Request::Commit => match self.failing_commit.take() {
                Some((code, state)) => Reply::EndUnitOfWork {
                    sqlcard: Some(Diagnostic::new(code, state).to_wire()),
                },
                None => {
                    self.commits += 1;
                    Reply::EndUnitOfWork { sqlcard: None }
                }
            },
            Request::Rollback => {
                self.rollbacks += 1;
                Reply::EndUnitOfWork { sqlcard: None }
            }
        }
    }

    fn access_security(&mut self, mechanism: u16, token: Option<Vec<u8>>) -> Reply {
        if !self.mechanisms.contains(&mechanism) {
            return Reply::SecurityAccepted {
                mechanisms: self.mechanisms.clone(),
                token: None,
            };
        }
        self.client_token = token.unwrap_or_default();
        let token = match mechanism {
            secmec::USRENCPWD | secmec::EUSRIDPWD => {
                let keys = EncryptionManager::new();
                let public = keys.public_key_bytes().to_vec();
                self.server_keys = Some(keys);
                Some(public)
            }
            secmec::USRSSBPWD => Some(SERVER_SEED.to_vec()),
            _ => None,
        };
        Reply::SecurityAccepted {
            mechanisms: vec![mechanism],
            token: if self.withhold_token { None } else { token },
        }
    }

    fn security_check(&mut self, credentials: &Credentials) -> Reply {
        self.credentials = Some(credentials.clone());
        let accepted = match self.verify(credentials) {
            Some((user, password)) => {
                user == self.user && password.map_or(true, |p| p == self.password)
            }
            None => false,
        };
        if accepted {
            self.authenticated = Some(self.user.clone());
            Reply::SecurityChecked {
                check_code: 0,
                sqlcard: None,
            }
        } else {
            Reply::SecurityChecked {
                check_code: 0x0F,
                sqlcard: None,
            }
        }
    }

    /// Recover the user id and password the client presented
    fn verify(&mut self, credentials: &Credentials) -> Option<(String, Option<String>)> {
        let client_token = self.client_token.clone();
        match credentials {
            Credentials::UserPassword { user, password } => {
                Some((user.clone(), Some(password.clone())))
            }
            Credentials::UserOnly { user } => Some((user.clone(), None)),
            Credentials::EncryptedPassword { user, password } => {
                let keys = self.server_keys.as_mut()?;
                let plain = keys
                    .decrypt(password, secmec::USRENCPWD, user.as_bytes(), &client_token)
                    .ok()?;
                Some((user.clone(), Some(String::from_utf8(plain).ok()?)))
            }
            Credentials::PasswordSubstitute { user, substitute } => {
                let expected = EncryptionManager::new()
                    .substitute_password(user, &self.password, &client_token, &SERVER_SEED)
                    .ok()?;
                let password = if expected.as_slice() == substitute.as_slice() {
                    self.password.clone()
                } else {
                    String::new()
                };
                Some((user.clone(), Some(password)))
            }
            Credentials::EncryptedUserPassword { user, password } => {
                let keys = self.server_keys.as_mut()?;
                let public = keys.public_key_bytes();
                let user = keys
                    .decrypt(user, secmec::EUSRIDPWD, &public, &client_token)
                    .ok()?;
                let password = keys
                    .decrypt(password, secmec::EUSRIDPWD, &public, &client_token)
                    .ok()?;
                Some((
                    String::from_utf8(user).ok()?,
                    Some(String::from_utf8(password).ok()?),
                ))
            }
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Reply {
        if sql.contains("SYSIBM.SQLCAMESSAGE") {
            return self.format_message(params);
        }
        if sql.contains("SYSIBM.BLOB") || sql.contains("SYSIBM.CLOB") {
            return self.locator_procedure(sql, params);
        }

        if let Some(Value::Integer(key)) = params.first() {
            if self.failing_rows.contains(key) {
                return error(-803, "23505", &["SQL_PK", "T"]);
            }
        }
        match self.responses.get(sql).cloned() {
            Some(Response::Count(count)) => count_reply(count),
            Some(Response::Error(code, state, tokens)) => error(code, state, &tokens),
            Some(Response::Warning(code, state, tokens)) => Reply::sql(Some(
                Diagnostic::new(code, state).with_tokens(&tokens).to_wire(),
            )),
            Some(Response::Values(values)) => Reply::Sql {
                sqlcard: None,
                values,
            },
            None => count_reply(1),
        }
    }

    fn format_message(&self, params: &[Value]) -> Reply {
        let code = params.first().and_then(Value::as_i64).unwrap_or(0);
        let tokens = params
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or("")
            .replace('\u{14}', ", ");
        let state = params.get(11).and_then(Value::as_str).unwrap_or("");
        let mut values = vec![Value::Null; params.len()];
        values[14] = Value::String(format!("[{}] {} ({})", state, tokens, code));
        values[15] = Value::Integer(0);
        Reply::Sql {
            sqlcard: None,
            values,
        }
    }

    fn locator_procedure(&mut self, sql: &str, params: &[Value]) -> Reply {
        let int = |i: usize| params.get(i).and_then(Value::as_i64).unwrap_or(0);
        let blob = sql.contains("SYSIBM.BLOB");
        let mut values = vec![Value::Null; params.len()];

        if sql.contains("CREATELOCATOR") {
            let id = self.allocate();
            if blob {
                self.blobs.insert(id, Vec::new());
            } else {
                self.clobs.insert(id, Vec::new());
            }
            values[0] = Value::Integer(id);
            return Reply::Sql {
                sqlcard: None,
                values,
            };
        }

        // Every other procedure names its locator in the first input
        let locator_index = if sql.starts_with("? =") { 1 } else { 0 };
        let locator = int(locator_index) as i32;
        let exists = if blob {
            self.blobs.contains_key(&locator)
        } else {
            self.clobs.contains_key(&locator)
        };
        if !exists {
            return error(-1, "XJ217", &[&locator.to_string()]);
        }

        if sql.contains("RELEASELOCATOR") {
            self.blobs.remove(&locator);
            self.clobs.remove(&locator);
            self.released.push(locator);
        } else if sql.contains("GETLENGTH") {
            let length = if blob {
                self.blobs[&locator].len()
            } else {
                self.clobs[&locator].len()
            };
            values[0] = Value::BigInt(length as i64);
        } else if sql.contains("GETBYTES") || sql.contains("GETSUBSTRING") {
            let start = (int(2) - 1) as usize;
            let count = int(3) as usize;
            if blob {
                let data = &self.blobs[&locator];
                let start = start.min(data.len());
                let end = (start + count).min(data.len());
                values[0] = Value::Bytes(data[start..end].to_vec());
            } else {
                let data = &self.clobs[&locator];
                let start = start.min(data.len());
                let end = (start + count).min(data.len());
                values[0] = Value::String(data[start..end].iter().collect());
            }
        } else if sql.contains("SETBYTES") || sql.contains("SETSTRING") {
            let start = (int(1) - 1) as usize;
            if blob {
                let chunk = params[3].as_bytes().unwrap_or_default().to_vec();
                write_at(self.blobs.entry(locator).or_default(), start, &chunk);
            } else {
                let chunk: Vec<char> = params[3].as_str().unwrap_or_default().chars().collect();
                write_at(self.clobs.entry(locator).or_default(), start, &chunk);
            }
        } else if sql.contains("TRUNCATE") {
            let length = int(1) as usize;
            if blob {
                self.blobs.entry(locator).or_default().truncate(length);
            } else {
                self.clobs.entry(locator).or_default().truncate(length);
            }
        } else if sql.contains("POSITIONFROMLOCATOR") {
            let pattern = int(2) as i32;
            let from = int(3) as usize;
            let found = if blob {
                match self.blobs.get(&pattern) {
                    Some(p) => search(&self.blobs[&locator], p, from),
                    None => return error(-1, "XJ217", &[&pattern.to_string()]),
                }
            } else {
                match self.clobs.get(&pattern) {
                    Some(p) => search(&self.clobs[&locator], p, from),
                    None => return error(-1, "XJ217", &[&pattern.to_string()]),
                }
            };
            values[0] = Value::BigInt(found);
        } else if sql.contains("POSITIONFROM") {
            let from = int(3) as usize;
            let found = if blob {
                let pattern = params[2].as_bytes().unwrap_or_default().to_vec();
                search(&self.blobs[&locator], &pattern, from)
            } else {
                let pattern: Vec<char> = params[2].as_str().unwrap_or_default().chars().collect();
                search(&self.clobs[&locator], &pattern, from)
            };
            values[0] = Value::BigInt(found);
        }
        Reply::Sql {
            sqlcard: None,
            values,
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::ExchangeServerAttributes { .. } => "EXCSAT",
        Request::AccessSecurity { .. } => "ACCSEC",
        Request::SecurityCheck { .. } => "SECCHK",
        Request::AccessRdb { .. } => "ACCRDB",
        Request::Prepare { .. } => "PRPSQLSTT",
        Request::Execute { .. } => "EXCSQLSTT",
        Request::Commit => "RDBCMM",
        Request::Rollback => "RDBRLLBCK",
    }
}

fn error<S: AsRef<str>>(code: i32, state: &str, tokens: &[S]) -> Reply {
    Reply::sql(Some(
        Diagnostic::new(code, state).with_tokens(tokens).to_wire(),
    ))
}

fn count_reply(count: i32) -> Reply {
    Reply::sql(Some(
        Diagnostic::success()
            .with_errd([0, 0, count, 0, 0, 0])
            .to_wire(),
    ))
}

fn write_at<T: Copy + Default>(data: &mut Vec<T>, start: usize, chunk: &[T]) {
    let end = start + chunk.len();
    if data.len() < end {
        data.resize(end, T::default());
    }
    data[start..end].copy_from_slice(chunk);
}

/// 1-based position of `pattern` at or after `from`, 0 when absent
fn search<T: PartialEq>(data: &[T], pattern: &[T], from: usize) -> i64 {
    if pattern.is_empty() || from == 0 {
        return 0;
    }
    let start = from - 1;
    if start + pattern.len() > data.len() {
        return 0;
    }
    (start..=data.len() - pattern.len())
        .find(|&i| &data[i..i + pattern.len()] == pattern)
        .map(|i| i as i64 + 1)
        .unwrap_or(0)
}

/// Shared handle on the fake server
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new())),
        }
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, ServerState> {
        self.state.lock()
    }

    /// A new client connection to this server
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            state: Arc::clone(&self.state),
            queued: Vec::new(),
            replies: VecDeque::new(),
            connected: true,
        })
    }

    /// Connect with the default credentials and clear-text mechanism
    pub fn connect(&self) -> Connection {
        self.connect_with(config())
            .expect("handshake with the fake server should succeed")
    }

    pub fn connect_with(&self, config: Config) -> drda_client::Result<Connection> {
        Connection::connect_with_transport(config, self.transport())
    }
}

pub fn config() -> Config {
    Config::new("fake", 1527, DATABASE, USER, PASSWORD)
}

pub fn config_with(mechanism: SecurityMechanism) -> Config {
    config().security_mechanism(mechanism)
}

/// Client side of the in-memory connection
pub struct FakeTransport {
    state: Arc<Mutex<ServerState>>,
    queued: Vec<Request>,
    replies: VecDeque<Reply>,
    connected: bool,
}

fn connection_reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
}

impl Transport for FakeTransport {
    fn send(&mut self, request: &Request) -> io::Result<()> {
        if !self.connected {
            return Err(connection_reset());
        }
        self.queued.push(request.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.connected {
            return Err(connection_reset());
        }
        let mut state = self.state.lock();
        state.flushes += 1;
        for request in self.queued.drain(..) {
            let reply = state.process(&request);
            self.replies.push_back(reply);
        }
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Reply> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.break_after_replies.as_mut() {
            if *remaining == 0 {
                state.break_after_replies = None;
                self.connected = false;
                return Err(connection_reset());
            }
            *remaining -= 1;
        }
        self.replies
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no reply pending"))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) -> io::Result<()> {
        if self.connected {
            self.connected = false;
            self.state.lock().closes += 1;
        }
        Ok(())
    }
}
