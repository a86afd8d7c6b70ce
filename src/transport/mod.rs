//! Transport layer for DRDA connections
//!
//! A [`Transport`] moves typed requests and replies. Requests are buffered by
//! [`Transport::send`] and written together by [`Transport::flush`], which is
//! what turns a write chain into one network round trip. Replies are read
//! back one at a time in request order.

mod tcp;

pub use tcp::{read_dss, TcpTransport};

use std::io;

use crate::messages::{Reply, Request};

/// Trait for transport implementations
pub trait Transport: Send {
    /// Queue a request in the current write chain
    fn send(&mut self, request: &Request) -> io::Result<()>;

    /// Write every queued request to the server
    fn flush(&mut self) -> io::Result<()>;

    /// Read the next reply
    fn receive(&mut self) -> io::Result<Reply>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    fn close(&mut self) -> io::Result<()>;
}
