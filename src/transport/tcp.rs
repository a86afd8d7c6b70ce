//! TCP transport implementation
//!
//! Provides a blocking TCP transport that frames each request in its own
//! DSS, chains the DSSes of one write chain, and reassembles continued
//! reply segments.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::constants::{dss_type, DSS_HEADER_SIZE};
use crate::messages::{Reply, Request};
use crate::packet::{Dss, DssHeader, CONTINUATION_BIT, CONTINUATION_HEADER_SIZE};

use crate::trace::hex_prefix;

use super::Transport;

/// Payload bytes shown in trace output
const TRACE_BYTES: usize = 32;

/// TCP transport for DRDA connections
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    pending: Vec<Bytes>,
    next_correlation: u16,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `timeout` per address
    pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(%addr, "TCP connection established");
                    return Ok(Self::from_stream(stream));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            )
        }))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            pending: Vec::new(),
            next_correlation: 1,
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, request: &Request) -> io::Result<()> {
        self.stream_mut()?;
        self.pending.push(request.encode());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        let mut out = BytesMut::new();
        for (i, payload) in pending.into_iter().enumerate() {
            let correlation = self.next_correlation;
            self.next_correlation = self.next_correlation.wrapping_add(1).max(1);
            let dss = Dss::new(dss_type::REQUEST, correlation, payload).chained(i + 1 < count);
            out.extend_from_slice(&dss.encode());
        }
        let stream = self.stream_mut()?;
        stream.write_all(&out)?;
        stream.flush()
    }

    fn receive(&mut self) -> io::Result<Reply> {
        let dss = read_dss(self.stream_mut()?)?;
        tracing::trace!(
            correlation = dss.correlation_id(),
            payload = %hex_prefix(&dss.payload, TRACE_BYTES),
            "received DSS"
        );
        Reply::decode(dss.payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Read one DSS, following continuation segments
pub fn read_dss<R: Read>(reader: &mut R) -> io::Result<Dss> {
    let mut header_bytes = [0u8; DSS_HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = DssHeader::parse(&header_bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let mut payload = vec![0u8; header.payload_length()];
    reader.read_exact(&mut payload)?;

    let mut continued = header.continued;
    while continued {
        let mut length = [0u8; CONTINUATION_HEADER_SIZE];
        reader.read_exact(&mut length)?;
        let raw = u16::from_be_bytes(length);
        continued = raw & CONTINUATION_BIT != 0;
        let size = ((raw & !CONTINUATION_BIT) as usize).saturating_sub(CONTINUATION_HEADER_SIZE);
        let start = payload.len();
        payload.resize(start + size, 0);
        reader.read_exact(&mut payload[start..])?;
    }

    Ok(Dss {
        header,
        payload: Bytes::from(payload),
    })
}
