#![warn(missing_docs)]

//! # drda-client
//!
//! A synchronous DRDA client core in pure Rust.
//!
//! This crate implements the client side of the DRDA (Distributed Relational
//! Database Architecture) protocol as spoken by Derby-compatible network
//! servers: DSS framing, DDM requests and replies, the security handshake,
//! SQLCA diagnostics and server-side large object locators.
//!
//! ## Features
//!
//! - **Chained exceptions** - every server and client failure of a round trip
//!   is reported as one [`SqlError`] chain, most severe first
//! - **Deferred failures** - errors raised where nothing can return them
//!   (releasing a dropped locator, for instance) surface on the next call
//! - **Encrypted credentials** - user id and password encryption over
//!   Diffie-Hellman and DES, and strong password substitution
//! - **Large objects** - [`Blob`] and [`Clob`] values held in memory, read
//!   from streams, or backed by server locators
//! - **Batches** - one statement executed for many rows with per-row update
//!   counts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drda_client::{Connection, Value};
//!
//! fn main() -> drda_client::Result<()> {
//!     let conn = Connection::connect_str("localhost:1527/sample", "app", "secret")?;
//!
//!     let results = conn.execute(
//!         "UPDATE accounts SET balance = balance - ? WHERE id = ?",
//!         &[Value::Integer(50), Value::Integer(1)],
//!     )?;
//!     println!("Rows updated: {}", results.update_count());
//!
//!     conn.commit()?;
//!     conn.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Security Mechanisms
//!
//! ```rust,no_run
//! use drda_client::{Config, Connection, SecurityMechanism};
//!
//! # fn example() -> drda_client::Result<()> {
//! let config = Config::new("dbhost", 1527, "sample", "app", "secret")
//!     .security_mechanism(SecurityMechanism::EncryptedUserIdPassword);
//! let conn = Connection::connect(config)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! use drda_client::{Connection, Error, Value};
//!
//! # fn example(conn: Connection) {
//! match conn.execute("INSERT INTO t VALUES (?)", &[Value::Integer(1)]) {
//!     Ok(_) => {}
//!     Err(Error::Sql(e)) => {
//!         for link in e.iter() {
//!             eprintln!("{} ({})", link.message(), link.sql_state());
//!         }
//!     }
//!     Err(e) => eprintln!("{}", e),
//! }
//! # }
//! ```
//!
//! ## Large Objects
//!
//! ```rust,no_run
//! use std::io::Read;
//! use drda_client::Connection;
//!
//! # fn example(conn: Connection) -> drda_client::Result<()> {
//! let mut clob = conn.create_clob()?;
//! clob.set_string(1, "hello world")?;
//! assert_eq!(clob.position("world", 1)?, 7);
//!
//! let mut text = String::new();
//! clob.character_stream()?.read_to_string(&mut text)?;
//! clob.free()?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod agent;
pub mod batch;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod diagnostic;
pub mod error;
pub mod exception;
pub mod locator;
pub mod messages;
pub mod packet;
pub mod statement;
pub mod statement_cache;
mod trace;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use agent::{AgentSettings, ServerInfo};
pub use batch::{failed_rows, BatchBinds, BatchBuilder, BatchResult};
pub use config::{Config, SecurityMechanism};
pub use connection::Connection;
pub use constants::{EXECUTE_FAILED, SUCCESS_NO_INFO};
pub use diagnostic::Diagnostic;
pub use error::{Error, Result, SqlError, SqlErrorKind};
pub use exception::MessageId;
pub use locator::LobFamily;
pub use statement::{CallResults, CallableStatement};
pub use transport::Transport;
pub use types::{
    materialize_stream, Blob, BlobReader, BlobWriter, ChunkedBytes, Clob, ClobReader, ClobWriter,
    SqlType, Value,
};
