//! LOB base state
//!
//! State shared by [`Blob`](super::Blob) and [`Clob`](super::Clob): the
//! owning connection and transaction, the free flag, the update counter used
//! to invalidate open streams, stream materialization and the argument checks
//! common to both types.
//!
//! A LOB is backed by one of:
//!
//! - a view into a shared buffer at some data offset, copied on first write,
//! - an owned buffer,
//! - a caller-supplied stream, read into memory on first use,
//! - a server-side locator, valid only inside the transaction that created it.

use std::cmp::min;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::connection::Connection;
use crate::constants::{MATERIALIZE_CHUNK_SIZE, MAX_LOB_LENGTH, VARCHAR_MAXWIDTH};
use crate::exception::{MessageId, SqlException, SqlResult};
use crate::locator::LobFamily;

/// Connection and transaction a LOB belongs to
#[derive(Debug, Clone)]
pub(crate) struct LobOwner {
    connection: Option<Connection>,
    transaction_id: u64,
}

impl LobOwner {
    /// A LOB built by the application, not bound to any session
    pub(crate) fn detached() -> Self {
        Self {
            connection: None,
            transaction_id: 0,
        }
    }

    /// A LOB created in the current transaction of `connection`
    pub(crate) fn attached(connection: Connection) -> Self {
        let transaction_id = connection.transaction_id();
        Self {
            connection: Some(connection),
            transaction_id,
        }
    }
}

/// Validity, free flag and update counter of one LOB
#[derive(Debug)]
pub(crate) struct LobState {
    owner: LobOwner,
    counter: Arc<AtomicU64>,
    freed: bool,
}

impl LobState {
    pub(crate) fn new(owner: LobOwner) -> Self {
        Self {
            owner,
            counter: Arc::new(AtomicU64::new(0)),
            freed: false,
        }
    }

    /// Fail unless the LOB may be used
    ///
    /// A freed LOB reports `LobFreed`. A LOB whose connection is closed, or
    /// a locator whose transaction has ended, reports `LobObjectInvalid`.
    pub(crate) fn check(&self, locator_based: bool) -> SqlResult<()> {
        if self.freed {
            return Err(SqlException::client(MessageId::LobFreed, Vec::<String>::new()));
        }
        if let Some(connection) = &self.owner.connection {
            if connection.is_closed()
                || (locator_based && connection.transaction_id() != self.owner.transaction_id)
            {
                return Err(SqlException::client(
                    MessageId::LobObjectInvalid,
                    Vec::<String>::new(),
                ));
            }
        }
        Ok(())
    }

    /// Owning connection; locator LOBs always have one
    pub(crate) fn connection(&self) -> SqlResult<&Connection> {
        self.owner
            .connection
            .as_ref()
            .ok_or_else(|| SqlException::client(MessageId::LobObjectInvalid, Vec::<String>::new()))
    }

    pub(crate) fn owner_connection(&self) -> Option<&Connection> {
        self.owner.connection.as_ref()
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed
    }

    /// Mark the LOB freed; returns whether it already was
    pub(crate) fn mark_freed(&mut self) -> bool {
        std::mem::replace(&mut self.freed, true)
    }

    /// Record a mutation, invalidating every stream opened before it
    pub(crate) fn bump(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Current update count
    pub(crate) fn update_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Token that notices any later mutation
    pub(crate) fn token(&self) -> UpdateToken {
        UpdateToken {
            counter: self.counter.clone(),
            seen: self.counter.load(Ordering::SeqCst),
        }
    }
}

/// Optimistic invalidation token handed to streams
#[derive(Debug, Clone)]
pub(crate) struct UpdateToken {
    counter: Arc<AtomicU64>,
    seen: u64,
}

impl UpdateToken {
    /// Fail with `LobChanged` once the LOB was modified
    pub(crate) fn check(&self) -> io::Result<()> {
        if self.counter.load(Ordering::SeqCst) != self.seen {
            return Err(to_io_error(SqlException::client(
                MessageId::LobChanged,
                Vec::<String>::new(),
            )));
        }
        Ok(())
    }
}

pub(crate) fn to_io_error<E>(e: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, e)
}

// =============================================================================
// Materialization
// =============================================================================

/// Bytes read from a stream, kept as a list of fixed-size chunks
///
/// Every chunk but the last holds exactly `MATERIALIZE_CHUNK_SIZE` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedBytes {
    chunks: Vec<Vec<u8>>,
    len: u64,
}

impl ChunkedBytes {
    /// Total number of bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no bytes were read
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte_at(&self, index: u64) -> u8 {
        let size = MATERIALIZE_CHUNK_SIZE as u64;
        self.chunks[(index / size) as usize][(index % size) as usize]
    }

    /// Copy bytes starting at the 0-based `offset` into `out`
    ///
    /// Returns the number of bytes copied, short only at the end of data.
    pub fn copy_range(&self, offset: u64, out: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut skip = offset;
        for chunk in &self.chunks {
            if copied == out.len() {
                break;
            }
            let chunk_len = chunk.len() as u64;
            if skip >= chunk_len {
                skip -= chunk_len;
                continue;
            }
            let start = skip as usize;
            let take = min(chunk.len() - start, out.len() - copied);
            out[copied..copied + take].copy_from_slice(&chunk[start..start + take]);
            copied += take;
            skip = 0;
        }
        copied
    }

    /// 1-based position of `pattern` at or after the 1-based `start`, or -1
    ///
    /// Searches the chunks in place.
    pub fn find(&self, pattern: &[u8], start: u64) -> i64 {
        let from = start.saturating_sub(1);
        let width = pattern.len() as u64;
        if pattern.is_empty() || from >= self.len || width > self.len - from {
            return -1;
        }
        (from..=self.len - width)
            .find(|&at| {
                pattern
                    .iter()
                    .enumerate()
                    .all(|(i, b)| self.byte_at(at + i as u64) == *b)
            })
            .map(|at| at as i64 + 1)
            .unwrap_or(-1)
    }

    /// Keep the first `len` bytes
    pub fn truncate(&mut self, len: u64) {
        if len >= self.len {
            return;
        }
        let size = MATERIALIZE_CHUNK_SIZE as u64;
        let keep = ((len + size - 1) / size) as usize;
        self.chunks.truncate(keep);
        if let Some(last) = self.chunks.last_mut() {
            last.truncate((len - (keep as u64 - 1) * size) as usize);
        }
        self.len = len;
    }

    /// Copy everything into one contiguous buffer
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Contiguous buffer, without copying when there is a single chunk
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.chunks.len() == 1 {
            return self.chunks.pop().unwrap_or_default();
        }
        self.to_vec()
    }
}

/// Read `reader` to exhaustion
///
/// `type_name` names the target type in error messages. A read failure is
/// reported as `StreamingIo`; a stream longer than the largest LOB as
/// `ValueTooLargeForType`.
pub fn materialize_stream<R>(reader: &mut R, type_name: &str) -> SqlResult<ChunkedBytes>
where
    R: Read + ?Sized,
{
    materialize_stream_with_limit(reader, type_name, MAX_LOB_LENGTH)
}

pub(crate) fn materialize_stream_with_limit<R>(
    reader: &mut R,
    type_name: &str,
    limit: u64,
) -> SqlResult<ChunkedBytes>
where
    R: Read + ?Sized,
{
    let mut data = ChunkedBytes::default();
    loop {
        let mut chunk = vec![0u8; MATERIALIZE_CHUNK_SIZE];
        let mut filled = 0;
        while filled < chunk.len() {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(SqlException::client(
                        MessageId::StreamingIo,
                        [type_name.to_string(), e.to_string()],
                    )
                    .with_cause(e))
                }
            }
        }
        if filled == 0 {
            break;
        }
        if data.len + filled as u64 > limit {
            return Err(SqlException::client(
                MessageId::ValueTooLargeForType,
                [type_name],
            ));
        }
        chunk.truncate(filled);
        data.len += filled as u64;
        let short = filled < MATERIALIZE_CHUNK_SIZE;
        data.chunks.push(chunk);
        if short {
            break;
        }
    }
    tracing::trace!(type_name = type_name, length = data.len, "Materialized stream");
    Ok(data)
}

// =============================================================================
// Argument checks
// =============================================================================

/// 1-based position, which must be positive
pub(crate) fn check_position(pos: i64) -> SqlResult<u64> {
    if pos <= 0 {
        return Err(SqlException::client(MessageId::BlobBadPosition, [pos]));
    }
    Ok(pos as u64)
}

pub(crate) fn check_length(length: i64) -> SqlResult<u64> {
    if length < 0 {
        return Err(SqlException::client(
            MessageId::BlobNonpositiveLength,
            [length],
        ));
    }
    Ok(length as u64)
}

/// `pos` may point at most one past the end
pub(crate) fn check_position_in_range(pos: u64, length: u64) -> SqlResult<()> {
    if pos - 1 > length {
        return Err(SqlException::client(
            MessageId::BlobPositionTooLarge,
            [pos],
        ));
    }
    Ok(())
}

/// Target range of a write must stay addressable
pub(crate) fn check_write_target(pos: u64, len: usize) -> SqlResult<()> {
    if pos > MAX_LOB_LENGTH || pos - 1 + len as u64 > MAX_LOB_LENGTH {
        return Err(SqlException::client(
            MessageId::BlobPositionTooLarge,
            [pos],
        ));
    }
    Ok(())
}

/// `offset` and `len` must select data inside a source of `available` units
pub(crate) fn check_source_range(available: usize, offset: usize, len: usize) -> SqlResult<()> {
    if offset > available {
        return Err(SqlException::client(
            MessageId::BlobInvalidOffset,
            [offset],
        ));
    }
    if len > available - offset {
        return Err(SqlException::client(MessageId::BlobLengthTooLong, [len]));
    }
    Ok(())
}

/// Range of a stream view must end inside the LOB
pub(crate) fn check_stream_range(pos: i64, len: i64, length: u64) -> SqlResult<(u64, u64)> {
    let pos = check_position(pos)?;
    let len = check_length(len)?;
    if pos + len > length + 1 {
        return Err(SqlException::client(
            MessageId::PositionAndLengthGreaterThanLob,
            [pos, len],
        ));
    }
    Ok((pos, len))
}

pub(crate) fn check_truncate(new_length: i64, length: u64) -> SqlResult<u64> {
    if new_length < 0 || new_length as u64 > length {
        return Err(SqlException::client(
            MessageId::InvalidApiParameter,
            [new_length.to_string(), "len".to_string()],
        ));
    }
    Ok(new_length as u64)
}

pub(crate) fn check_pattern<T>(pattern: &[T]) -> SqlResult<()> {
    if pattern.is_empty() {
        return Err(SqlException::client(
            MessageId::BlobNullPattern,
            Vec::<String>::new(),
        ));
    }
    Ok(())
}

/// Naive search for `pattern` at or after the 1-based `start`
///
/// Returns the 1-based position of the first match, or -1.
pub(crate) fn find<T: PartialEq>(data: &[T], pattern: &[T], start: u64) -> i64 {
    let from = (start - 1) as usize;
    if pattern.is_empty() || from >= data.len() || pattern.len() > data.len() - from {
        return -1;
    }
    data[from..]
        .windows(pattern.len())
        .position(|window| window == pattern)
        .map(|i| (from + i + 1) as i64)
        .unwrap_or(-1)
}

/// Write `chunk` at the 0-based `start`, growing `buffer` exactly as needed
pub(crate) fn write_into<T: Copy + Default>(buffer: &mut Vec<T>, start: usize, chunk: &[T]) {
    let end = start + chunk.len();
    if buffer.len() < end {
        buffer.resize(end, T::default());
    }
    buffer[start..end].copy_from_slice(chunk);
}

// =============================================================================
// Stream views
// =============================================================================

#[derive(Debug)]
enum CursorSource {
    /// Data copied when the view was opened
    Snapshot,
    /// Data fetched lazily from a locator
    Locator {
        connection: Connection,
        family: LobFamily,
        locator: i32,
    },
}

/// Sequential reader over a LOB, shared by the binary and character views
#[derive(Debug)]
pub(crate) struct LobCursor {
    source: CursorSource,
    /// Next 1-based position to fetch from a locator
    position: u64,
    /// 1-based position after the last unit to read
    end: u64,
    pending: Bytes,
    token: UpdateToken,
}

impl LobCursor {
    /// View over bytes already in memory
    pub(crate) fn snapshot(data: Bytes, token: UpdateToken) -> Self {
        Self {
            source: CursorSource::Snapshot,
            position: 0,
            end: 0,
            pending: data,
            token,
        }
    }

    /// View over `len` units of a locator starting at the 1-based `pos`
    pub(crate) fn locator(
        connection: Connection,
        family: LobFamily,
        locator: i32,
        pos: u64,
        len: u64,
        token: UpdateToken,
    ) -> Self {
        Self {
            source: CursorSource::Locator {
                connection,
                family,
                locator,
            },
            position: pos,
            end: pos + len,
            pending: Bytes::new(),
            token,
        }
    }

    /// Fetch the next chunk; false at the end of data
    fn refill(&mut self) -> io::Result<bool> {
        let (connection, family, locator) = match &self.source {
            CursorSource::Snapshot => return Ok(false),
            CursorSource::Locator {
                connection,
                family,
                locator,
            } => (connection, *family, *locator),
        };
        if self.position >= self.end {
            return Ok(false);
        }
        let count = min(self.end - self.position, VARCHAR_MAXWIDTH as u64) as usize;
        let from = self.position;
        let data = match family {
            LobFamily::Blob => {
                connection.with_locator(|procs| procs.blob_get_bytes(locator, from, count))
            }
            LobFamily::Clob => connection
                .with_locator(|procs| procs.clob_get_substring(locator, from, count))
                .map(String::into_bytes),
        }
        .map_err(to_io_error)?;
        if data.is_empty() {
            self.end = self.position;
            return Ok(false);
        }
        self.position += count as u64;
        self.pending = Bytes::from(data);
        Ok(true)
    }
}

impl Read for LobCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.token.check()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.has_remaining() && !self.refill()? {
            return Ok(0);
        }
        let n = min(buf.len(), self.pending.remaining());
        self.pending.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader returning at most `step` bytes per call, with interruptions
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        interrupted: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::Error::new(io::ErrorKind::Interrupted, "try again"));
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn test_materialize_in_chunks() {
        let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        let mut reader = Trickle {
            data: data.clone(),
            pos: 0,
            step: 1000,
            interrupted: false,
        };
        let chunks = materialize_stream(&mut reader, "BLOB").unwrap();
        assert_eq!(chunks.len(), 102_400);
        assert_eq!(chunks.chunks.len(), 4);
        assert_eq!(chunks.to_vec(), data);

        let mut out = [0u8; 10];
        assert_eq!(chunks.copy_range(32 * 1024 - 5, &mut out), 10);
        assert_eq!(&out[..], &data[32 * 1024 - 5..32 * 1024 + 5]);
        assert_eq!(chunks.copy_range(102_395, &mut out), 5);
    }

    #[test]
    fn test_materialize_limit() {
        let err = materialize_stream_with_limit(&mut &[0u8; 100][..], "BLOB", 64).unwrap_err();
        assert_eq!(err.message_id(), Some(MessageId::ValueTooLargeForType));
        assert_eq!(err.sql_state(), "22003");
        assert!(materialize_stream_with_limit(&mut &[0u8; 64][..], "BLOB", 64).is_ok());
    }

    #[test]
    fn test_materialize_io_error() {
        let err = materialize_stream(&mut Failing, "CLOB").unwrap_err();
        assert_eq!(err.message_id(), Some(MessageId::StreamingIo));
        assert!(err.to_string().contains("pipe closed"));
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_empty_stream() {
        let chunks = materialize_stream(&mut io::empty(), "BLOB").unwrap();
        assert!(chunks.is_empty());
        assert!(chunks.to_vec().is_empty());
    }

    #[test]
    fn test_find() {
        let data = b"abcabcab";
        assert_eq!(find(data, b"abc", 1), 1);
        assert_eq!(find(data, b"abc", 2), 4);
        assert_eq!(find(data, b"cab", 7), -1);
        assert_eq!(find(data, b"abcabcabcabc", 1), -1);
        assert_eq!(find(data, b"b", 9), -1);
        assert_eq!(find(data, b"b", 100), -1);
    }

    #[test]
    fn test_chunked_search_and_truncate() {
        let mut data = vec![0u8; 70_000];
        data[32 * 1024 - 2..32 * 1024 + 2].copy_from_slice(b"edge");
        data[69_990..69_994].copy_from_slice(b"tail");
        let mut chunks = materialize_stream(&mut &data[..], "BLOB").unwrap();

        assert_eq!(chunks.find(b"edge", 1), 32 * 1024 - 1);
        assert_eq!(chunks.find(b"tail", 40_000), 69_991);
        assert_eq!(chunks.find(b"edge", 32 * 1024), -1);

        chunks.truncate(32 * 1024 + 1);
        assert_eq!(chunks.len(), 32 * 1024 + 1);
        assert_eq!(chunks.chunks.len(), 2);
        assert_eq!(chunks.find(b"edg", 1), 32 * 1024 - 1);
        assert_eq!(chunks.find(b"edge", 1), -1);
        chunks.truncate(0);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_single_chunk_into_vec() {
        let chunks = materialize_stream(&mut &b"abc"[..], "BLOB").unwrap();
        assert_eq!(chunks.into_vec(), b"abc");
    }

    #[test]
    fn test_write_into_grows_exactly() {
        let mut buffer = vec![1u8, 2, 3];
        write_into(&mut buffer, 5, &[9, 9]);
        assert_eq!(buffer, vec![1, 2, 3, 0, 0, 9, 9]);
        write_into(&mut buffer, 0, &[7]);
        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer[0], 7);
    }

    #[test]
    fn test_argument_checks() {
        assert_eq!(check_position(0).unwrap_err().sql_state(), "XJ070");
        assert_eq!(check_position(1).unwrap(), 1);
        assert_eq!(check_length(-1).unwrap_err().sql_state(), "XJ071");
        assert_eq!(check_position_in_range(5, 3).unwrap_err().sql_state(), "XJ076");
        assert!(check_position_in_range(4, 3).is_ok());
        assert_eq!(check_source_range(4, 5, 0).unwrap_err().sql_state(), "XJ078");
        assert_eq!(check_source_range(4, 1, 4).unwrap_err().sql_state(), "XJ079");
        assert!(check_source_range(4, 1, 3).is_ok());
        assert_eq!(check_stream_range(2, 5, 5).unwrap_err().sql_state(), "XJ087");
        assert_eq!(check_stream_range(2, 4, 5).unwrap(), (2, 4));
        assert_eq!(check_truncate(-1, 5).unwrap_err().sql_state(), "XJ081");
        assert_eq!(check_truncate(6, 5).unwrap_err().sql_state(), "XJ081");
        assert_eq!(check_pattern::<u8>(&[]).unwrap_err().sql_state(), "XJ072");
        assert_eq!(check_write_target(MAX_LOB_LENGTH, 2).unwrap_err().sql_state(), "XJ076");
    }

    #[test]
    fn test_update_token() {
        let state = LobState::new(LobOwner::detached());
        let token = state.token();
        assert!(token.check().is_ok());
        state.bump();
        assert_eq!(state.update_count(), 1);
        let err = token.check().unwrap_err();
        assert!(err.to_string().contains("modified"));
    }

    #[test]
    fn test_freed_state() {
        let mut state = LobState::new(LobOwner::detached());
        assert!(state.check(false).is_ok());
        assert!(!state.mark_freed());
        assert!(state.mark_freed());
        assert_eq!(state.check(false).unwrap_err().sql_state(), "XJ073");
        assert_eq!(state.connection().unwrap_err().sql_state(), "XJ215");
    }

    #[test]
    fn test_snapshot_cursor() {
        let state = LobState::new(LobOwner::detached());
        let mut cursor = LobCursor::snapshot(Bytes::from_static(b"hello"), state.token());
        let mut out = String::new();
        cursor.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }
}
