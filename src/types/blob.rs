//! Binary large objects

use std::cmp::min;
use std::fmt;
use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::connection::Connection;
use crate::constants::MAX_LOB_LENGTH;
use crate::error::Result;
use crate::locator::LobFamily;

use super::lob::{
    check_length, check_pattern, check_position, check_position_in_range, check_source_range,
    check_stream_range, check_truncate, check_write_target, find, materialize_stream,
    to_io_error, write_into, ChunkedBytes, LobCursor, LobOwner, LobState,
};

enum BlobData {
    /// Bytes of a larger buffer from `offset` on; copied on the first write
    Shared { buffer: Bytes, offset: usize },
    /// Bytes owned by this value
    Owned(Vec<u8>),
    /// Caller stream not read yet
    Stream {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
    /// Stream read into fixed-size chunks
    Chunks(ChunkedBytes),
    /// Value held by the server
    Locator { id: i32, length: Option<u64> },
}

impl BlobData {
    fn contiguous(&self) -> Option<&[u8]> {
        match self {
            BlobData::Shared { buffer, offset } => Some(&buffer[*offset..]),
            BlobData::Owned(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A BLOB value
///
/// Positions are 1-based, as in SQL.
///
/// # Example
///
/// ```rust
/// use drda_client::Blob;
///
/// let mut blob = Blob::new(b"hello world".to_vec());
/// assert_eq!(blob.get_bytes(7, 5)?, b"world");
/// assert_eq!(blob.position(b"o", 6)?, 8);
/// blob.truncate(5)?;
/// assert_eq!(blob.length()?, 5);
/// # Ok::<(), drda_client::Error>(())
/// ```
pub struct Blob {
    data: BlobData,
    state: LobState,
}

impl Blob {
    /// Create a BLOB holding `bytes`
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            data: BlobData::Owned(bytes),
            state: LobState::new(LobOwner::detached()),
        }
    }

    /// Create a BLOB over the bytes of `buffer` from `offset` on
    ///
    /// Nothing is copied until the value is written to. An offset past the
    /// end of `buffer` fails with `BlobInvalidOffset`.
    pub fn from_buffer(buffer: Bytes, offset: usize) -> Result<Self> {
        check_source_range(buffer.len(), offset, 0)?;
        Ok(Self {
            data: BlobData::Shared { buffer, offset },
            state: LobState::new(LobOwner::detached()),
        })
    }

    /// Create a BLOB read lazily from `reader`
    ///
    /// A declared `length` is reported by [`length`](Self::length) until the
    /// stream is read; at most that many bytes are read, and a shorter stream
    /// leaves the value shorter. With `length` unknown, the first call that
    /// needs the length reads the whole stream into memory. A large enough
    /// stream exhausts memory.
    pub fn from_reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            data: BlobData::Stream {
                reader: Box::new(reader),
                length,
            },
            state: LobState::new(LobOwner::detached()),
        }
    }

    pub(crate) fn attached(connection: Connection, bytes: Vec<u8>) -> Self {
        Self {
            data: BlobData::Owned(bytes),
            state: LobState::new(LobOwner::attached(connection)),
        }
    }

    pub(crate) fn from_locator(connection: Connection, id: i32, length: Option<u64>) -> Self {
        Self {
            data: BlobData::Locator { id, length },
            state: LobState::new(LobOwner::attached(connection)),
        }
    }

    /// Whether the value is held by the server
    pub fn is_locator(&self) -> bool {
        matches!(self.data, BlobData::Locator { .. })
    }

    /// Server locator, if any
    pub fn locator(&self) -> Option<i32> {
        match self.data {
            BlobData::Locator { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether [`free`](Self::free) was called
    pub fn is_freed(&self) -> bool {
        self.state.is_freed()
    }

    fn check(&self) -> Result<()> {
        self.state.check(self.is_locator())?;
        Ok(())
    }

    /// Length in bytes
    ///
    /// For a stream not read yet this is the declared length, if any.
    pub fn length(&mut self) -> Result<u64> {
        self.check()?;
        match &mut self.data {
            BlobData::Shared { buffer, offset } => Ok((buffer.len() - *offset) as u64),
            BlobData::Owned(bytes) => Ok(bytes.len() as u64),
            BlobData::Chunks(chunks) => Ok(chunks.len()),
            BlobData::Stream {
                length: Some(length),
                ..
            } => Ok(*length),
            BlobData::Stream { length: None, .. } => {
                self.materialize_stream()?;
                self.length()
            }
            BlobData::Locator {
                length: Some(length),
                ..
            } => Ok(*length),
            BlobData::Locator { id, length } => {
                let id = *id;
                let known = self
                    .state
                    .connection()?
                    .with_locator(|procs| procs.get_length(LobFamily::Blob, id))?;
                *length = Some(known);
                Ok(known)
            }
        }
    }

    /// Length of the data actually present, reading a stream first
    fn loaded_length(&mut self) -> Result<u64> {
        self.materialize_stream()?;
        self.length()
    }

    /// Read a stream value, or fetch a locator value, into memory
    ///
    /// A fetched locator is released on the server.
    pub fn materialize(&mut self) -> Result<()> {
        self.check()?;
        match self.data {
            BlobData::Stream { .. } => self.materialize_stream(),
            BlobData::Locator { id, .. } => {
                let length = self.length()?;
                let bytes = self.get_bytes(1, min(length, MAX_LOB_LENGTH) as i32)?;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.release_locator(LobFamily::Blob, id))?;
                self.data = BlobData::Owned(bytes);
                Ok(())
            }
            BlobData::Shared { .. } | BlobData::Owned(_) | BlobData::Chunks(_) => Ok(()),
        }
    }

    fn materialize_stream(&mut self) -> Result<()> {
        if let BlobData::Stream { reader, length } = &mut self.data {
            let chunks = match *length {
                Some(declared) => materialize_stream(&mut reader.as_mut().take(declared), "BLOB")?,
                None => materialize_stream(reader.as_mut(), "BLOB")?,
            };
            self.data = BlobData::Chunks(chunks);
        }
        Ok(())
    }

    /// Bytes for a write, copying shared or chunked data first; `None` for a locator
    fn owned_bytes(&mut self) -> Result<Option<&mut Vec<u8>>> {
        self.materialize_stream()?;
        let copied = match &self.data {
            BlobData::Shared { buffer, offset } => Some(buffer[*offset..].to_vec()),
            BlobData::Chunks(chunks) => Some(chunks.to_vec()),
            _ => None,
        };
        if let Some(bytes) = copied {
            self.data = BlobData::Owned(bytes);
        }
        match &mut self.data {
            BlobData::Owned(bytes) => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    /// Read up to `length` bytes starting at `pos`
    ///
    /// The result is shorter than `length` when the value ends first.
    pub fn get_bytes(&mut self, pos: i64, length: i32) -> Result<Vec<u8>> {
        self.check()?;
        let pos = check_position(pos)?;
        let length = check_length(length as i64)?;
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        let count = min(length, total - (pos - 1)) as usize;
        let start = (pos - 1) as usize;

        match &self.data {
            BlobData::Chunks(chunks) => {
                let mut out = vec![0u8; count];
                let copied = chunks.copy_range(pos - 1, &mut out);
                out.truncate(copied);
                Ok(out)
            }
            BlobData::Locator { id, .. } => {
                let id = *id;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.blob_get_bytes(id, pos, count))
            }
            data => Ok(data
                .contiguous()
                .map(|bytes| bytes[start..start + count].to_vec())
                .unwrap_or_default()),
        }
    }

    /// Write all of `data` starting at `pos`; returns the bytes written
    pub fn set_bytes(&mut self, pos: i64, data: &[u8]) -> Result<usize> {
        self.set_bytes_range(pos, data, 0, data.len())
    }

    /// Write `len` bytes of `data` from `offset`, starting at `pos`
    ///
    /// The value grows as needed; it never shrinks. Returns the bytes
    /// written.
    pub fn set_bytes_range(
        &mut self,
        pos: i64,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<usize> {
        self.check()?;
        let pos = check_position(pos)?;
        check_write_target(pos, 0)?;
        check_source_range(data.len(), offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        check_write_target(pos, len)?;
        let chunk = &data[offset..offset + len];

        if let BlobData::Locator { id, length } = &mut self.data {
            let id = *id;
            self.state
                .connection()?
                .with_locator(|procs| procs.blob_set_bytes(id, pos, chunk))?;
            let end = pos - 1 + len as u64;
            *length = Some(total.max(end));
        } else if let Some(bytes) = self.owned_bytes()? {
            write_into(bytes, (pos - 1) as usize, chunk);
        }
        self.state.bump();
        Ok(len)
    }

    /// Position of `pattern` at or after `start`, or -1
    pub fn position(&mut self, pattern: &[u8], start: i64) -> Result<i64> {
        self.check()?;
        let start = check_position(start)?;
        check_pattern(pattern)?;

        self.materialize_stream()?;
        match &self.data {
            BlobData::Locator { id, .. } => {
                let id = *id;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.blob_position(id, pattern, start))
            }
            BlobData::Chunks(chunks) => Ok(chunks.find(pattern, start)),
            data => Ok(data
                .contiguous()
                .map_or(-1, |bytes| find(bytes, pattern, start))),
        }
    }

    /// Position of the value of `pattern` at or after `start`, or -1
    ///
    /// When both values are locators the search runs on the server without
    /// transferring the pattern.
    pub fn position_blob(&mut self, pattern: &mut Blob, start: i64) -> Result<i64> {
        self.check()?;
        pattern.check()?;
        let start = check_position(start)?;

        if let (BlobData::Locator { id, .. }, Some(pattern_id)) = (&self.data, pattern.locator()) {
            let id = *id;
            if pattern.length()? == 0 {
                check_pattern::<u8>(&[])?;
            }
            return self.state.connection()?.with_locator(|procs| {
                procs.position_from_locator(LobFamily::Blob, id, pattern_id, start)
            });
        }
        let length = pattern.loaded_length()?;
        let bytes = pattern.get_bytes(1, min(length, MAX_LOB_LENGTH) as i32)?;
        self.position(&bytes, start as i64)
    }

    /// Shorten the value to `length` bytes
    pub fn truncate(&mut self, length: i64) -> Result<()> {
        self.check()?;
        let total = self.loaded_length()?;
        let length = check_truncate(length, total)?;
        if length == total {
            return Ok(());
        }

        match &mut self.data {
            BlobData::Locator { id, length: cached } => {
                let id = *id;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.truncate(LobFamily::Blob, id, length))?;
                *cached = Some(length);
            }
            BlobData::Shared { buffer, offset } => buffer.truncate(*offset + length as usize),
            BlobData::Owned(bytes) => {
                bytes.truncate(length as usize);
                bytes.shrink_to_fit();
            }
            BlobData::Chunks(chunks) => chunks.truncate(length),
            BlobData::Stream { .. } => {}
        }
        self.state.bump();
        Ok(())
    }

    /// Release the value
    ///
    /// Idempotent. Later operations fail with `LobFreed`.
    pub fn free(&mut self) -> Result<()> {
        let releasable = self.is_locator() && self.state.check(true).is_ok();
        if self.state.mark_freed() {
            return Ok(());
        }
        let data = std::mem::replace(&mut self.data, BlobData::Owned(Vec::new()));
        if let (BlobData::Locator { id, .. }, true) = (data, releasable) {
            self.state
                .connection()?
                .with_locator(|procs| procs.release_locator(LobFamily::Blob, id))?;
        }
        Ok(())
    }

    /// Reader over the whole value
    pub fn binary_stream(&mut self) -> Result<BlobReader> {
        let length = self.loaded_length()?;
        self.binary_stream_range(1, length as i64)
    }

    /// Reader over `length` bytes starting at `pos`
    ///
    /// The reader fails with `LobChanged` once the value is modified.
    pub fn binary_stream_range(&mut self, pos: i64, length: i64) -> Result<BlobReader> {
        self.check()?;
        let total = self.loaded_length()?;
        let (pos, length) = check_stream_range(pos, length, total)?;
        let token = self.state.token();
        let start = (pos - 1) as usize;
        let end = start + length as usize;

        let snapshot = match &self.data {
            BlobData::Locator { id, .. } => {
                let connection = self.state.connection()?.clone();
                return Ok(BlobReader(LobCursor::locator(
                    connection,
                    LobFamily::Blob,
                    *id,
                    pos,
                    length,
                    token,
                )));
            }
            BlobData::Shared { buffer, offset } => buffer.slice(offset + start..offset + end),
            BlobData::Owned(bytes) => Bytes::copy_from_slice(&bytes[start..end]),
            BlobData::Chunks(chunks) => {
                let mut out = vec![0u8; length as usize];
                chunks.copy_range(pos - 1, &mut out);
                Bytes::from(out)
            }
            BlobData::Stream { .. } => Bytes::new(),
        };
        Ok(BlobReader(LobCursor::snapshot(snapshot, token)))
    }

    /// Writer starting at `pos`
    pub fn set_binary_stream(&mut self, pos: i64) -> Result<BlobWriter<'_>> {
        self.check()?;
        let pos = check_position(pos)?;
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        Ok(BlobWriter {
            blob: self,
            position: pos as i64,
        })
    }

    #[cfg(test)]
    fn update_count(&self) -> u64 {
        self.state.update_count()
    }

    #[cfg(test)]
    fn is_shared(&self) -> bool {
        matches!(self.data, BlobData::Shared { .. })
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if self.state.is_freed() {
            return;
        }
        if let BlobData::Locator { id, .. } = self.data {
            if self.state.check(true).is_ok() {
                if let Some(connection) = self.state.owner_connection() {
                    connection.release_deferred(LobFamily::Blob, id);
                }
            }
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.data {
            BlobData::Shared { buffer, offset } => {
                format!("shared({} bytes at {})", buffer.len() - offset, offset)
            }
            BlobData::Owned(bytes) => format!("memory({} bytes)", bytes.len()),
            BlobData::Stream { length, .. } => format!("stream({:?})", length),
            BlobData::Chunks(chunks) => format!("chunks({} bytes)", chunks.len()),
            BlobData::Locator { id, .. } => format!("locator({})", id),
        };
        f.debug_struct("Blob")
            .field("backing", &backing)
            .field("freed", &self.state.is_freed())
            .finish()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob::new(bytes)
    }
}

/// Reader returned by [`Blob::binary_stream`]
#[derive(Debug)]
pub struct BlobReader(LobCursor);

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Writer returned by [`Blob::set_binary_stream`]
#[derive(Debug)]
pub struct BlobWriter<'a> {
    blob: &'a mut Blob,
    position: i64,
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self
            .blob
            .set_bytes(self.position, buf)
            .map_err(to_io_error)?;
        self.position += written as i64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.blob.state.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::MessageId;

    fn state(e: crate::Error) -> String {
        e.sql_state().unwrap_or_default().to_string()
    }

    #[test]
    fn test_get_bytes_clamps() {
        let mut blob = Blob::new(b"abcdef".to_vec());
        assert_eq!(blob.get_bytes(5, 10).unwrap(), b"ef");
        assert_eq!(blob.get_bytes(7, 10).unwrap(), b"");
        assert_eq!(state(blob.get_bytes(0, 1).unwrap_err()), "XJ070");
        assert_eq!(state(blob.get_bytes(1, -1).unwrap_err()), "XJ071");
        assert_eq!(state(blob.get_bytes(8, 1).unwrap_err()), "XJ076");
    }

    #[test]
    fn test_set_bytes_grows_exactly() {
        let mut blob = Blob::new(b"abc".to_vec());
        assert_eq!(blob.set_bytes(4, b"de").unwrap(), 2);
        assert_eq!(blob.length().unwrap(), 5);
        assert_eq!(blob.set_bytes(2, b"X").unwrap(), 1);
        assert_eq!(blob.get_bytes(1, 5).unwrap(), b"aXcde");
        assert_eq!(blob.set_bytes_range(1, b"0123", 1, 2).unwrap(), 2);
        assert_eq!(blob.get_bytes(1, 5).unwrap(), b"12cde");
        assert_eq!(blob.set_bytes_range(1, b"0123", 4, 0).unwrap(), 0);
    }

    #[test]
    fn test_set_bytes_validation() {
        let mut blob = Blob::new(b"abc".to_vec());
        assert_eq!(state(blob.set_bytes(0, b"x").unwrap_err()), "XJ070");
        assert_eq!(state(blob.set_bytes(5, b"x").unwrap_err()), "XJ076");
        assert_eq!(state(blob.set_bytes_range(1, b"xy", 3, 0).unwrap_err()), "XJ078");
        assert_eq!(state(blob.set_bytes_range(1, b"xy", 1, 2).unwrap_err()), "XJ079");
        assert_eq!(blob.update_count(), 0);
    }

    #[test]
    fn test_position() {
        let mut blob = Blob::new(b"abcabc".to_vec());
        assert_eq!(blob.position(b"bc", 1).unwrap(), 2);
        assert_eq!(blob.position(b"bc", 3).unwrap(), 5);
        assert_eq!(blob.position(b"abcabcabc", 1).unwrap(), -1);
        assert_eq!(state(blob.position(b"", 1).unwrap_err()), "XJ072");
        assert_eq!(state(blob.position(b"a", 0).unwrap_err()), "XJ070");

        let mut pattern = Blob::new(b"ca".to_vec());
        assert_eq!(blob.position_blob(&mut pattern, 1).unwrap(), 3);
    }

    #[test]
    fn test_truncate() {
        let mut blob = Blob::new(b"abcdef".to_vec());
        blob.truncate(6).unwrap();
        assert_eq!(blob.update_count(), 0);
        blob.truncate(2).unwrap();
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"ab");
        assert_eq!(blob.update_count(), 1);
        assert_eq!(state(blob.truncate(3).unwrap_err()), "XJ081");
        assert_eq!(state(blob.truncate(-1).unwrap_err()), "XJ081");
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut blob = Blob::new(b"abc".to_vec());
        blob.free().unwrap();
        blob.free().unwrap();
        assert!(blob.is_freed());
        let err = blob.length().unwrap_err();
        assert_eq!(err.message_id(), Some(MessageId::LobFreed));
    }

    #[test]
    fn test_stream_backed_length() {
        let data = vec![5u8; 70_000];
        let mut known = Blob::from_reader(io::Cursor::new(data.clone()), Some(70_000));
        assert_eq!(known.length().unwrap(), 70_000);
        assert_eq!(known.get_bytes(69_999, 5).unwrap(), vec![5, 5]);

        let mut unknown = Blob::from_reader(io::Cursor::new(data), None);
        assert_eq!(unknown.length().unwrap(), 70_000);
        assert_eq!(unknown.position(&[5, 5, 5], 69_998).unwrap(), 69_998);
    }

    #[test]
    fn test_declared_length_longer_than_stream() {
        let mut blob = Blob::from_reader(io::Cursor::new(b"abc".to_vec()), Some(10));
        assert_eq!(blob.length().unwrap(), 10);
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"abc");
        assert_eq!(blob.length().unwrap(), 3);
        assert_eq!(state(blob.get_bytes(5, 1).unwrap_err()), "XJ076");

        let mut out = Vec::new();
        let mut reread = Blob::from_reader(io::Cursor::new(b"abc".to_vec()), Some(10));
        reread.binary_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_declared_length_shorter_than_stream() {
        let mut blob = Blob::from_reader(io::Cursor::new(b"abcdef".to_vec()), Some(4));
        assert_eq!(blob.position(b"ef", 1).unwrap(), -1);
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"abcd");
    }

    #[test]
    fn test_shared_buffer_copies_on_write() {
        let carrier = Bytes::from_static(b"HEADERpayload");
        let mut blob = Blob::from_buffer(carrier.clone(), 6).unwrap();
        assert_eq!(blob.length().unwrap(), 7);
        assert_eq!(blob.position(b"load", 1).unwrap(), 4);
        blob.truncate(3).unwrap();
        assert!(blob.is_shared());
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"pay");

        blob.set_bytes(1, b"P").unwrap();
        assert!(!blob.is_shared());
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"Pay");
        assert_eq!(&carrier[..], b"HEADERpayload");

        let err = Blob::from_buffer(carrier, 14).unwrap_err();
        assert_eq!(err.sql_state(), Some("XJ078"));
    }

    #[test]
    fn test_chunked_value_is_searched_in_place() {
        let mut data = vec![1u8; 40_000];
        data[39_000] = 2;
        let mut blob = Blob::from_reader(io::Cursor::new(data), None);
        assert_eq!(blob.position(&[2], 1).unwrap(), 39_001);
        blob.truncate(39_000).unwrap();
        assert_eq!(blob.position(&[2], 1).unwrap(), -1);
        assert!(format!("{:?}", blob).contains("chunks(39000 bytes)"));
    }

    #[test]
    fn test_reader_invalidated_by_update() {
        let mut blob = Blob::new(b"0123456789".to_vec());
        let mut reader = blob.binary_stream_range(3, 4).unwrap();
        let mut first = [0u8; 2];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"23");

        blob.set_bytes(1, b"x").unwrap();
        let err = reader.read(&mut first).unwrap_err();
        assert!(err.to_string().contains("modified"));

        assert_eq!(state(blob.binary_stream_range(8, 4).unwrap_err()), "XJ087");
    }

    #[test]
    fn test_writer() {
        let mut blob = Blob::new(Vec::new());
        {
            let mut writer = blob.set_binary_stream(1).unwrap();
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"world").unwrap();
            writer.flush().unwrap();
        }
        let mut out = Vec::new();
        blob.binary_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }
}
