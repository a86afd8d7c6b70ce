//! Character large objects
//!
//! Lengths and positions count characters, not bytes. Streams carry UTF-8.

use std::cmp::min;
use std::fmt;
use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::connection::Connection;
use crate::constants::MAX_LOB_LENGTH;
use crate::error::Result;
use crate::exception::{MessageId, SqlException, SqlResult};
use crate::locator::LobFamily;

use super::lob::{
    check_length, check_pattern, check_position, check_position_in_range, check_source_range,
    check_stream_range, check_truncate, check_write_target, materialize_stream, to_io_error,
    LobCursor, LobOwner, LobState,
};

enum ClobData {
    /// UTF-8 text of a larger buffer from byte `offset` on; copied on the first write
    Shared { text: Bytes, offset: usize },
    Owned(String),
    Stream {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
    Locator { id: i32, length: Option<u64> },
}

impl ClobData {
    fn text(&self) -> SqlResult<Option<&str>> {
        match self {
            ClobData::Shared { text, offset } => decode(&text[*offset..]).map(Some),
            ClobData::Owned(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }
}

fn streaming_error(e: std::str::Utf8Error) -> SqlException {
    SqlException::client(MessageId::StreamingIo, ["CLOB".to_string(), e.to_string()]).with_cause(e)
}

fn decode(bytes: &[u8]) -> SqlResult<&str> {
    std::str::from_utf8(bytes).map_err(streaming_error)
}

/// Byte index of the 0-based character `index`; the text length past the end
fn byte_index(text: &str, index: usize) -> usize {
    text.char_indices().nth(index).map_or(text.len(), |(i, _)| i)
}

/// Text of a stream, cut to the declared character count
///
/// Bytes past the declared characters need not be valid UTF-8.
fn decode_stream(mut bytes: Vec<u8>, declared: Option<u64>) -> SqlResult<String> {
    let invalid = std::str::from_utf8(&bytes).err();
    if let Some(e) = invalid {
        let valid = e.valid_up_to();
        let decoded = std::str::from_utf8(&bytes[..valid]).map_or(0, |t| t.chars().count());
        if declared.map_or(true, |n| (decoded as u64) < n) {
            return Err(streaming_error(e));
        }
        bytes.truncate(valid);
    }
    let mut text = String::from_utf8(bytes).map_err(|e| streaming_error(e.utf8_error()))?;
    if let Some(n) = declared {
        let end = byte_index(&text, n as usize);
        text.truncate(end);
    }
    Ok(text)
}

/// A CLOB value
///
/// # Example
///
/// ```rust
/// use drda_client::Clob;
///
/// let mut clob = Clob::new("grüße, world");
/// assert_eq!(clob.length()?, 12);
/// assert_eq!(clob.get_sub_string(1, 5)?, "grüße");
/// assert_eq!(clob.position("world", 1)?, 8);
/// # Ok::<(), drda_client::Error>(())
/// ```
pub struct Clob {
    data: ClobData,
    state: LobState,
}

impl Clob {
    /// Create a CLOB holding `text`
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            data: ClobData::Owned(text.into()),
            state: LobState::new(LobOwner::detached()),
        }
    }

    /// Create a CLOB over the UTF-8 text of `buffer` from byte `offset` on
    ///
    /// Nothing is copied until the value is written to. The text must be
    /// valid UTF-8 starting at `offset`.
    pub fn from_buffer(buffer: Bytes, offset: usize) -> Result<Self> {
        check_source_range(buffer.len(), offset, 0)?;
        if let Err(e) = std::str::from_utf8(&buffer[offset..]) {
            return Err(SqlException::client(
                MessageId::InvalidApiParameter,
                [e.to_string(), "buffer".to_string()],
            )
            .into());
        }
        Ok(Self {
            data: ClobData::Shared {
                text: buffer,
                offset,
            },
            state: LobState::new(LobOwner::detached()),
        })
    }

    /// Create a CLOB read lazily from a UTF-8 `reader`
    ///
    /// `length` counts characters. A declared length is reported by
    /// [`length`](Self::length) until the stream is read; only that many
    /// characters are kept, and a shorter stream leaves the value shorter.
    /// With `length` unknown, the first call that needs the length reads the
    /// whole stream into memory. A large enough stream exhausts memory.
    pub fn from_reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            data: ClobData::Stream {
                reader: Box::new(reader),
                length,
            },
            state: LobState::new(LobOwner::detached()),
        }
    }

    pub(crate) fn attached(connection: Connection, text: String) -> Self {
        Self {
            data: ClobData::Owned(text),
            state: LobState::new(LobOwner::attached(connection)),
        }
    }

    pub(crate) fn from_locator(connection: Connection, id: i32, length: Option<u64>) -> Self {
        Self {
            data: ClobData::Locator { id, length },
            state: LobState::new(LobOwner::attached(connection)),
        }
    }

    /// Whether the value is held by the server
    pub fn is_locator(&self) -> bool {
        matches!(self.data, ClobData::Locator { .. })
    }

    /// Server locator, if any
    pub fn locator(&self) -> Option<i32> {
        match self.data {
            ClobData::Locator { id, .. } => Some(id),
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

    /// Length in characters
    ///
    /// For a stream not read yet this is the declared length, if any.
    pub fn length(&mut self) -> Result<u64> {
        self.check()?;
        match &mut self.data {
            ClobData::Shared { text, offset } => Ok(decode(&text[*offset..])?.chars().count() as u64),
            ClobData::Owned(text) => Ok(text.chars().count() as u64),
            ClobData::Stream {
                length: Some(length),
                ..
            } => Ok(*length),
            ClobData::Stream { length: None, .. } => {
                self.materialize_stream()?;
                self.length()
            }
            ClobData::Locator {
                length: Some(length),
                ..
            } => Ok(*length),
            ClobData::Locator { id, length } => {
                let id = *id;
                let known = self
                    .state
                    .connection()?
                    .with_locator(|procs| procs.get_length(LobFamily::Clob, id))?;
                *length = Some(known);
                Ok(known)
            }
        }
    }

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
            ClobData::Stream { .. } => self.materialize_stream(),
            ClobData::Locator { id, .. } => {
                let length = self.length()?;
                let text = self.get_sub_string(1, min(length, MAX_LOB_LENGTH) as i32)?;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.release_locator(LobFamily::Clob, id))?;
                self.data = ClobData::Owned(text);
                Ok(())
            }
            ClobData::Shared { .. } | ClobData::Owned(_) => Ok(()),
        }
    }

    fn materialize_stream(&mut self) -> Result<()> {
        if let ClobData::Stream { reader, length } = &mut self.data {
            let declared = *length;
            let bytes = match declared {
                // At most four bytes per character
                Some(n) => {
                    materialize_stream(&mut reader.as_mut().take(n.saturating_mul(4)), "CLOB")?
                }
                None => materialize_stream(reader.as_mut(), "CLOB")?,
            };
            let text = decode_stream(bytes.into_vec(), declared)?;
            self.data = ClobData::Owned(text);
        }
        Ok(())
    }

    /// Text for a write, copying shared text first; `None` for a locator
    fn owned_text(&mut self) -> Result<Option<&mut String>> {
        self.materialize_stream()?;
        if let ClobData::Shared { text, offset } = &self.data {
            let copied = decode(&text[*offset..])?.to_string();
            self.data = ClobData::Owned(copied);
        }
        match &mut self.data {
            ClobData::Owned(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }

    /// Read up to `length` characters starting at `pos`
    pub fn get_sub_string(&mut self, pos: i64, length: i32) -> Result<String> {
        self.check()?;
        let pos = check_position(pos)?;
        let length = check_length(length as i64)?;
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        let count = min(length, total - (pos - 1)) as usize;

        if let ClobData::Locator { id, .. } = self.data {
            return self
                .state
                .connection()?
                .with_locator(|procs| procs.clob_get_substring(id, pos, count));
        }
        Ok(self
            .data
            .text()?
            .map(|text| text.chars().skip((pos - 1) as usize).take(count).collect())
            .unwrap_or_default())
    }

    /// Write all of `text` starting at `pos`; returns the characters written
    pub fn set_string(&mut self, pos: i64, text: &str) -> Result<usize> {
        let len = text.chars().count();
        self.set_string_range(pos, text, 0, len)
    }

    /// Write `len` characters of `text` from the character `offset`
    pub fn set_string_range(
        &mut self,
        pos: i64,
        text: &str,
        offset: usize,
        len: usize,
    ) -> Result<usize> {
        self.check()?;
        let pos = check_position(pos)?;
        check_write_target(pos, 0)?;
        check_source_range(text.chars().count(), offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        check_write_target(pos, len)?;
        let from = byte_index(text, offset);
        let chunk = &text[from..from + byte_index(&text[from..], len)];

        if let ClobData::Locator { id, length } = &mut self.data {
            let id = *id;
            let chars: Vec<char> = chunk.chars().collect();
            self.state
                .connection()?
                .with_locator(|procs| procs.clob_set_string(id, pos, &chars))?;
            let end = pos - 1 + len as u64;
            *length = Some(total.max(end));
        } else if let Some(owned) = self.owned_text()? {
            let start = (pos - 1) as usize;
            let replaced = byte_index(owned, start)..byte_index(owned, start + len);
            owned.replace_range(replaced, chunk);
        }
        self.state.bump();
        Ok(len)
    }

    /// Position of `pattern` at or after `start`, or -1
    pub fn position(&mut self, pattern: &str, start: i64) -> Result<i64> {
        self.check()?;
        let start = check_position(start)?;
        check_pattern(pattern.as_bytes())?;

        self.materialize_stream()?;
        if let ClobData::Locator { id, .. } = self.data {
            let pattern: Vec<char> = pattern.chars().collect();
            return self
                .state
                .connection()?
                .with_locator(|procs| procs.clob_position(id, &pattern, start));
        }
        let text = match self.data.text()? {
            Some(text) => text,
            None => return Ok(-1),
        };
        let from = byte_index(text, (start - 1) as usize);
        Ok(text[from..]
            .find(pattern)
            .map(|at| (text[..from + at].chars().count() + 1) as i64)
            .unwrap_or(-1))
    }

    /// Position of the value of `pattern` at or after `start`, or -1
    pub fn position_clob(&mut self, pattern: &mut Clob, start: i64) -> Result<i64> {
        self.check()?;
        pattern.check()?;
        let start = check_position(start)?;

        if let (ClobData::Locator { id, .. }, Some(pattern_id)) = (&self.data, pattern.locator()) {
            let id = *id;
            if pattern.length()? == 0 {
                check_pattern::<char>(&[])?;
            }
            return self.state.connection()?.with_locator(|procs| {
                procs.position_from_locator(LobFamily::Clob, id, pattern_id, start)
            });
        }
        let length = pattern.loaded_length()?;
        let text = pattern.get_sub_string(1, min(length, MAX_LOB_LENGTH) as i32)?;
        self.position(&text, start as i64)
    }

    /// Shorten the value to `length` characters
    pub fn truncate(&mut self, length: i64) -> Result<()> {
        self.check()?;
        let total = self.loaded_length()?;
        let length = check_truncate(length, total)?;
        if length == total {
            return Ok(());
        }

        match &mut self.data {
            ClobData::Locator { id, length: cached } => {
                let id = *id;
                self.state
                    .connection()?
                    .with_locator(|procs| procs.truncate(LobFamily::Clob, id, length))?;
                *cached = Some(length);
            }
            ClobData::Shared { text, offset } => {
                let end = byte_index(decode(&text[*offset..])?, length as usize);
                text.truncate(*offset + end);
            }
            ClobData::Owned(text) => {
                let end = byte_index(text, length as usize);
                text.truncate(end);
                text.shrink_to_fit();
            }
            ClobData::Stream { .. } => {}
        }
        self.state.bump();
        Ok(())
    }

    /// Release the value; idempotent
    pub fn free(&mut self) -> Result<()> {
        let releasable = self.is_locator() && self.state.check(true).is_ok();
        if self.state.mark_freed() {
            return Ok(());
        }
        let data = std::mem::replace(&mut self.data, ClobData::Owned(String::new()));
        if let (ClobData::Locator { id, .. }, true) = (data, releasable) {
            self.state
                .connection()?
                .with_locator(|procs| procs.release_locator(LobFamily::Clob, id))?;
        }
        Ok(())
    }

    /// UTF-8 reader over the whole value
    pub fn character_stream(&mut self) -> Result<ClobReader> {
        let length = self.loaded_length()?;
        self.character_stream_range(1, length as i64)
    }

    /// UTF-8 reader over `length` characters starting at `pos`
    pub fn character_stream_range(&mut self, pos: i64, length: i64) -> Result<ClobReader> {
        self.check()?;
        let total = self.loaded_length()?;
        let (pos, length) = check_stream_range(pos, length, total)?;
        let token = self.state.token();
        let start = (pos - 1) as usize;
        let end = start + length as usize;

        let snapshot = match &self.data {
            ClobData::Locator { id, .. } => {
                let connection = self.state.connection()?.clone();
                return Ok(ClobReader(LobCursor::locator(
                    connection,
                    LobFamily::Clob,
                    *id,
                    pos,
                    length,
                    token,
                )));
            }
            ClobData::Shared { text, offset } => {
                let view = decode(&text[*offset..])?;
                let (from, to) = (byte_index(view, start), byte_index(view, end));
                text.slice(offset + from..offset + to)
            }
            ClobData::Owned(text) => {
                let (from, to) = (byte_index(text, start), byte_index(text, end));
                Bytes::copy_from_slice(text[from..to].as_bytes())
            }
            ClobData::Stream { .. } => Bytes::new(),
        };
        Ok(ClobReader(LobCursor::snapshot(snapshot, token)))
    }

    /// UTF-8 writer starting at `pos`
    pub fn set_character_stream(&mut self, pos: i64) -> Result<ClobWriter<'_>> {
        self.check()?;
        let pos = check_position(pos)?;
        let total = self.loaded_length()?;
        check_position_in_range(pos, total)?;
        Ok(ClobWriter {
            clob: self,
            position: pos as i64,
            partial: Vec::new(),
        })
    }
}

impl Drop for Clob {
    fn drop(&mut self) {
        if self.state.is_freed() {
            return;
        }
        if let ClobData::Locator { id, .. } = self.data {
            if self.state.check(true).is_ok() {
                if let Some(connection) = self.state.owner_connection() {
                    connection.release_deferred(LobFamily::Clob, id);
                }
            }
        }
    }
}

impl fmt::Debug for Clob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.data {
            ClobData::Shared { text, offset } => {
                format!("shared({} bytes at {})", text.len() - offset, offset)
            }
            ClobData::Owned(text) => format!("memory({} bytes)", text.len()),
            ClobData::Stream { length, .. } => format!("stream({:?})", length),
            ClobData::Locator { id, .. } => format!("locator({})", id),
        };
        f.debug_struct("Clob")
            .field("backing", &backing)
            .field("freed", &self.state.is_freed())
            .finish()
    }
}

impl From<String> for Clob {
    fn from(text: String) -> Self {
        Clob::new(text)
    }
}

impl From<&str> for Clob {
    fn from(text: &str) -> Self {
        Clob::new(text)
    }
}

/// Reader returned by [`Clob::character_stream`]
#[derive(Debug)]
pub struct ClobReader(LobCursor);

impl Read for ClobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Writer returned by [`Clob::set_character_stream`]
///
/// Bytes that end in the middle of a UTF-8 sequence are held until the rest
/// arrives.
#[derive(Debug)]
pub struct ClobWriter<'a> {
    clob: &'a mut Clob,
    position: i64,
    partial: Vec<u8>,
}

impl Write for ClobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        let rest = self.partial.split_off(valid);
        let complete = std::mem::replace(&mut self.partial, rest);
        let text = String::from_utf8(complete)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if !text.is_empty() {
            let written = self
                .clob
                .set_string(self.position, &text)
                .map_err(to_io_error)?;
            self.position += written as i64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.clob.state.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(e: crate::Error) -> String {
        e.sql_state().unwrap_or_default().to_string()
    }

    #[test]
    fn test_character_positions() {
        let mut clob = Clob::new("añb€c");
        assert_eq!(clob.length().unwrap(), 5);
        assert_eq!(clob.get_sub_string(2, 3).unwrap(), "ñb€");
        assert_eq!(clob.position("€", 1).unwrap(), 4);
        assert_eq!(clob.position("x", 1).unwrap(), -1);
        assert_eq!(state(clob.position("", 1).unwrap_err()), "XJ072");
    }

    #[test]
    fn test_set_string_and_truncate() {
        let mut clob = Clob::new("hello");
        assert_eq!(clob.set_string(6, " wörld").unwrap(), 6);
        assert_eq!(clob.get_sub_string(1, 100).unwrap(), "hello wörld");
        assert_eq!(clob.set_string_range(1, "xHy", 1, 1).unwrap(), 1);
        assert_eq!(clob.get_sub_string(1, 5).unwrap(), "Hello");
        clob.truncate(5).unwrap();
        assert_eq!(clob.length().unwrap(), 5);
        assert_eq!(state(clob.truncate(6).unwrap_err()), "XJ081");
        assert_eq!(state(clob.set_string(7, "x").unwrap_err()), "XJ076");
    }

    #[test]
    fn test_stream_must_be_utf8() {
        let mut clob = Clob::from_reader(io::Cursor::new(vec![0x66, 0xFF, 0x66]), None);
        let err = clob.length().unwrap_err();
        assert_eq!(err.sql_state(), Some("XCL30"));
    }

    #[test]
    fn test_stream_backed() {
        let mut clob = Clob::from_reader(io::Cursor::new("ünïcode".as_bytes().to_vec()), Some(7));
        assert_eq!(clob.length().unwrap(), 7);
        assert_eq!(clob.get_sub_string(3, 3).unwrap(), "ïco");
    }

    #[test]
    fn test_declared_length_longer_than_stream() {
        let mut clob = Clob::from_reader(io::Cursor::new(b"abc".to_vec()), Some(10));
        assert_eq!(clob.length().unwrap(), 10);
        assert_eq!(clob.get_sub_string(1, 10).unwrap(), "abc");
        assert_eq!(clob.length().unwrap(), 3);

        let mut streamed = Clob::from_reader(io::Cursor::new(b"abc".to_vec()), Some(10));
        let mut out = String::new();
        streamed.character_stream().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");

        let mut ranged = Clob::from_reader(io::Cursor::new(b"abc".to_vec()), Some(10));
        assert_eq!(state(ranged.character_stream_range(1, 10).unwrap_err()), "XJ087");
    }

    #[test]
    fn test_declared_length_cuts_stream() {
        let mut clob = Clob::from_reader(io::Cursor::new(vec![0x66, 0xC3, 0xA9, 0xFF]), Some(2));
        assert_eq!(clob.get_sub_string(1, 5).unwrap(), "fé");
        assert_eq!(clob.length().unwrap(), 2);
    }

    #[test]
    fn test_shared_buffer_copies_on_write() {
        let carrier = Bytes::from("id=7;café au lait");
        let mut clob = Clob::from_buffer(carrier.clone(), 5).unwrap();
        assert_eq!(clob.length().unwrap(), 12);
        assert_eq!(clob.position("au", 2).unwrap(), 6);
        clob.truncate(4).unwrap();
        let mut out = String::new();
        clob.character_stream().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "café");

        clob.set_string(4, "E!").unwrap();
        assert_eq!(clob.get_sub_string(1, 10).unwrap(), "cafE!");
        assert_eq!(&carrier[..], "id=7;café au lait".as_bytes());

        let split = Clob::from_buffer(carrier, 9).unwrap_err();
        assert_eq!(split.sql_state(), Some("XJ081"));
    }

    #[test]
    fn test_character_stream_roundtrip() {
        let mut clob = Clob::new("");
        {
            let mut writer = clob.set_character_stream(1).unwrap();
            let text = "naïve café".as_bytes();
            // Split inside the two-byte 'ï'
            writer.write_all(&text[..3]).unwrap();
            writer.write_all(&text[3..]).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(clob.length().unwrap(), 10);
        let mut out = String::new();
        clob.character_stream().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "naïve café");
    }

    #[test]
    fn test_free() {
        let mut clob = Clob::new("abc");
        clob.free().unwrap();
        clob.free().unwrap();
        assert_eq!(state(clob.get_sub_string(1, 1).unwrap_err()), "XJ073");
    }
}
