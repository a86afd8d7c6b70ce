//! Locator procedure bridge
//!
//! Large objects that stay on the server are addressed through integer
//! locators. Every locator operation is a call to one of the `SYSIBM`
//! procedures below, prepared once per session through the agent's
//! statement cache.
//!
//! | Operation | BLOB | CLOB |
//! |---|---|---|
//! | create | `BLOBCREATELOCATOR` | `CLOBCREATELOCATOR` |
//! | release | `BLOBRELEASELOCATOR` | `CLOBRELEASELOCATOR` |
//! | length | `BLOBGETLENGTH` | `CLOBGETLENGTH` |
//! | read | `BLOBGETBYTES` | `CLOBGETSUBSTRING` |
//! | write | `BLOBSETBYTES` | `CLOBSETSTRING` |
//! | truncate | `BLOBTRUNCATE` | `CLOBTRUNCATE` |
//! | search | `BLOBGETPOSITIONFROMBYTES` | `CLOBGETPOSITIONFROMSTRING` |
//! | search by locator | `BLOBGETPOSITIONFROMLOCATOR` | `CLOBGETPOSITIONFROMLOCATOR` |
//!
//! A single call carries at most [`VARCHAR_MAXWIDTH`] bytes or characters.
//! Longer reads, writes and search patterns are split into several calls.

use crate::agent::{is_invalid_locator, is_missing_routine, Agent};
use crate::constants::{INVALID_LOCATOR, VARCHAR_MAXWIDTH};
use crate::exception::{MessageId, SqlException, SqlResult};
use crate::types::{SqlType, Value};

/// Which family of locator procedures to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobFamily {
    /// Binary large objects
    Blob,
    /// Character large objects
    Clob,
}

struct Procedures {
    create: &'static str,
    release: &'static str,
    length: &'static str,
    read: &'static str,
    write: &'static str,
    truncate: &'static str,
    position_from_literal: &'static str,
    position_from_locator: &'static str,
}

const BLOB_PROCEDURES: Procedures = Procedures {
    create: "? = CALL SYSIBM.BLOBCREATELOCATOR()",
    release: "CALL SYSIBM.BLOBRELEASELOCATOR(?)",
    length: "? = CALL SYSIBM.BLOBGETLENGTH(?)",
    read: "? = CALL SYSIBM.BLOBGETBYTES(?, ?, ?)",
    write: "CALL SYSIBM.BLOBSETBYTES(?, ?, ?, ?)",
    truncate: "CALL SYSIBM.BLOBTRUNCATE(?, ?)",
    position_from_literal: "? = CALL SYSIBM.BLOBGETPOSITIONFROMBYTES(?, ?, ?)",
    position_from_locator: "? = CALL SYSIBM.BLOBGETPOSITIONFROMLOCATOR(?, ?, ?)",
};

const CLOB_PROCEDURES: Procedures = Procedures {
    create: "? = CALL SYSIBM.CLOBCREATELOCATOR()",
    release: "CALL SYSIBM.CLOBRELEASELOCATOR(?)",
    length: "? = CALL SYSIBM.CLOBGETLENGTH(?)",
    read: "? = CALL SYSIBM.CLOBGETSUBSTRING(?, ?, ?)",
    write: "CALL SYSIBM.CLOBSETSTRING(?, ?, ?, ?)",
    truncate: "CALL SYSIBM.CLOBTRUNCATE(?, ?)",
    position_from_literal: "? = CALL SYSIBM.CLOBGETPOSITIONFROMSTRING(?, ?, ?)",
    position_from_locator: "? = CALL SYSIBM.CLOBGETPOSITIONFROMLOCATOR(?, ?, ?)",
};

impl LobFamily {
    fn procedures(self) -> &'static Procedures {
        match self {
            LobFamily::Blob => &BLOB_PROCEDURES,
            LobFamily::Clob => &CLOB_PROCEDURES,
        }
    }

    fn data_type(self) -> SqlType {
        match self {
            LobFamily::Blob => SqlType::VarBinary,
            LobFamily::Clob => SqlType::Varchar,
        }
    }

    /// Type name used in messages
    pub fn name(self) -> &'static str {
        match self {
            LobFamily::Blob => "BLOB",
            LobFamily::Clob => "CLOB",
        }
    }
}

/// Session-scoped feature detection for the locator procedures
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LocatorSupport {
    blob_unavailable: bool,
    clob_unavailable: bool,
}

impl LocatorSupport {
    fn is_unavailable(&self, family: LobFamily) -> bool {
        match family {
            LobFamily::Blob => self.blob_unavailable,
            LobFamily::Clob => self.clob_unavailable,
        }
    }

    fn mark_unavailable(&mut self, family: LobFamily) {
        match family {
            LobFamily::Blob => self.blob_unavailable = true,
            LobFamily::Clob => self.clob_unavailable = true,
        }
    }
}

/// Unit of LOB data moved by the procedures: bytes or characters
pub(crate) trait LocatorElement: Copy {
    /// Parameter value carrying `chunk`
    fn to_value(chunk: &[Self]) -> Value;

    /// Elements carried by a returned value
    fn from_value(value: Value) -> Vec<Self>;
}

impl LocatorElement for u8 {
    fn to_value(chunk: &[Self]) -> Value {
        Value::Bytes(chunk.to_vec())
    }

    fn from_value(mut value: Value) -> Vec<Self> {
        value.take_bytes().unwrap_or_default()
    }
}

impl LocatorElement for char {
    fn to_value(chunk: &[Self]) -> Value {
        Value::String(chunk.iter().collect())
    }

    fn from_value(mut value: Value) -> Vec<Self> {
        value
            .take_string()
            .map(|s| s.chars().collect())
            .unwrap_or_default()
    }
}

/// Bridge from LOB operations to the locator procedures of one session
pub(crate) struct LocatorProcedures<'a> {
    agent: &'a mut Agent,
}

impl<'a> LocatorProcedures<'a> {
    pub(crate) fn new(agent: &'a mut Agent) -> Self {
        Self { agent }
    }

    /// Allocate a new, empty locator
    ///
    /// Returns [`INVALID_LOCATOR`] when the server does not provide the
    /// procedure. That answer is remembered for the rest of the session and
    /// no further call is made.
    pub(crate) fn create_locator(&mut self, family: LobFamily) -> SqlResult<i32> {
        if self.agent.locator_support.is_unavailable(family) {
            return Ok(INVALID_LOCATOR);
        }
        let sql = family.procedures().create;
        match self
            .agent
            .call(sql, |stmt| stmt.register_out_parameter(1, SqlType::Integer))
        {
            Ok(results) => {
                let locator = results.get_int(1)?;
                tracing::trace!(family = family.name(), locator = locator, "Created locator");
                Ok(locator)
            }
            Err(e) if is_missing_routine(&e) => {
                tracing::debug!(
                    family = family.name(),
                    "Locator procedures unavailable, falling back to materialization"
                );
                self.agent.locator_support.mark_unavailable(family);
                Ok(INVALID_LOCATOR)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a locator on the server
    pub(crate) fn release_locator(&mut self, family: LobFamily, locator: i32) -> SqlResult<()> {
        tracing::trace!(family = family.name(), locator = locator, "release_locator");
        self.agent
            .call(family.procedures().release, |stmt| stmt.set_int(1, locator))
            .map_err(invalid_locator)?;
        Ok(())
    }

    /// Length of the value behind `locator`
    pub(crate) fn get_length(&mut self, family: LobFamily, locator: i32) -> SqlResult<u64> {
        tracing::trace!(family = family.name(), locator = locator, "get_length");
        let results = self
            .agent
            .call(family.procedures().length, |stmt| {
                stmt.register_out_parameter(1, SqlType::BigInt)?;
                stmt.set_int(2, locator)
            })
            .map_err(invalid_locator)?;
        Ok(results.get_long(1)?.max(0) as u64)
    }

    /// Read `for_length` bytes starting at the 1-based `from_pos`
    pub(crate) fn blob_get_bytes(
        &mut self,
        locator: i32,
        from_pos: u64,
        for_length: usize,
    ) -> SqlResult<Vec<u8>> {
        self.read_chunks(LobFamily::Blob, locator, from_pos, for_length)
    }

    /// Read `for_length` characters starting at the 1-based `from_pos`
    pub(crate) fn clob_get_substring(
        &mut self,
        locator: i32,
        from_pos: u64,
        for_length: usize,
    ) -> SqlResult<String> {
        let chars: Vec<char> = self.read_chunks(LobFamily::Clob, locator, from_pos, for_length)?;
        Ok(chars.into_iter().collect())
    }

    /// Write `data` starting at the 1-based `from_pos`
    pub(crate) fn blob_set_bytes(&mut self, locator: i32, from_pos: u64, data: &[u8]) -> SqlResult<()> {
        self.write_chunks(LobFamily::Blob, locator, from_pos, data)
    }

    /// Write `data` starting at the 1-based character position `from_pos`
    pub(crate) fn clob_set_string(&mut self, locator: i32, from_pos: u64, data: &[char]) -> SqlResult<()> {
        self.write_chunks(LobFamily::Clob, locator, from_pos, data)
    }

    /// Shorten the value behind `locator` to `length`
    pub(crate) fn truncate(&mut self, family: LobFamily, locator: i32, length: u64) -> SqlResult<()> {
        tracing::trace!(family = family.name(), locator = locator, length = length, "truncate");
        self.agent
            .call(family.procedures().truncate, |stmt| {
                stmt.set_int(1, locator)?;
                stmt.set_long(2, length as i64)
            })
            .map_err(invalid_locator)?;
        Ok(())
    }

    /// Position of `pattern` at or after `from_pos`, or -1
    pub(crate) fn blob_position(&mut self, locator: i32, pattern: &[u8], from_pos: u64) -> SqlResult<i64> {
        self.position_from_pattern(LobFamily::Blob, locator, pattern, from_pos)
    }

    /// Position of `pattern` at or after `from_pos`, or -1
    pub(crate) fn clob_position(&mut self, locator: i32, pattern: &[char], from_pos: u64) -> SqlResult<i64> {
        self.position_from_pattern(LobFamily::Clob, locator, pattern, from_pos)
    }

    /// Position of the value behind `pattern_locator`, or -1
    pub(crate) fn position_from_locator(
        &mut self,
        family: LobFamily,
        locator: i32,
        pattern_locator: i32,
        from_pos: u64,
    ) -> SqlResult<i64> {
        tracing::trace!(
            family = family.name(),
            locator = locator,
            pattern_locator = pattern_locator,
            from_pos = from_pos,
            "position_from_locator"
        );
        let results = self
            .agent
            .call(family.procedures().position_from_locator, |stmt| {
                stmt.register_out_parameter(1, SqlType::BigInt)?;
                stmt.set_int(2, locator)?;
                stmt.set_int(3, pattern_locator)?;
                stmt.set_long(4, from_pos as i64)
            })
            .map_err(invalid_locator)?;
        Ok(not_found_as_minus_one(results.get_long(1)?))
    }

    fn read_chunks<T: LocatorElement>(
        &mut self,
        family: LobFamily,
        locator: i32,
        from_pos: u64,
        for_length: usize,
    ) -> SqlResult<Vec<T>> {
        tracing::trace!(
            family = family.name(),
            locator = locator,
            from_pos = from_pos,
            length = for_length,
            "read"
        );
        let sql = family.procedures().read;
        let data_type = family.data_type();
        let mut data = Vec::with_capacity(for_length);
        let mut position = from_pos;
        let mut remaining = for_length;
        while remaining > 0 {
            let chunk = remaining.min(VARCHAR_MAXWIDTH);
            let mut results = self
                .agent
                .call(sql, |stmt| {
                    stmt.register_out_parameter(1, data_type)?;
                    stmt.set_int(2, locator)?;
                    stmt.set_long(3, position as i64)?;
                    stmt.set_int(4, chunk as i32)
                })
                .map_err(invalid_locator)?;
            let value = match data_type {
                SqlType::VarBinary => results.take_bytes(1)?.map(Value::Bytes),
                _ => results.take_string(1)?.map(Value::String),
            };
            let received = T::from_value(value.unwrap_or_default());
            if received.is_empty() {
                tracing::trace!(position = position, "Locator read ended early");
                break;
            }
            data.extend_from_slice(&received);
            position += chunk as u64;
            remaining -= chunk;
        }
        Ok(data)
    }

    fn write_chunks<T: LocatorElement>(
        &mut self,
        family: LobFamily,
        locator: i32,
        from_pos: u64,
        data: &[T],
    ) -> SqlResult<()> {
        tracing::trace!(
            family = family.name(),
            locator = locator,
            from_pos = from_pos,
            length = data.len(),
            "write"
        );
        let sql = family.procedures().write;
        let mut position = from_pos;
        for chunk in data.chunks(VARCHAR_MAXWIDTH) {
            self.agent
                .call(sql, |stmt| {
                    stmt.set_int(1, locator)?;
                    stmt.set_long(2, position as i64)?;
                    stmt.set_int(3, chunk.len() as i32)?;
                    stmt.set_value(4, T::to_value(chunk))
                })
                .map_err(invalid_locator)?;
            position += chunk.len() as u64;
        }
        Ok(())
    }

    fn position_call(&mut self, family: LobFamily, locator: i32, chunk: Value, from_pos: u64) -> SqlResult<i64> {
        let results = self
            .agent
            .call(family.procedures().position_from_literal, |stmt| {
                stmt.register_out_parameter(1, SqlType::BigInt)?;
                stmt.set_int(2, locator)?;
                stmt.set_value(3, chunk)?;
                stmt.set_long(4, from_pos as i64)
            })
            .map_err(invalid_locator)?;
        results.get_long(1)
    }

    /// Search for a pattern that may span several calls
    ///
    /// The first chunk of the pattern is located, then every further chunk
    /// must be found exactly where the previous one ended. On a mismatch the
    /// search starts over at the position after the first chunk's match. The
    /// total length is only fetched when a restart is needed.
    fn position_from_pattern<T: LocatorElement>(
        &mut self,
        family: LobFamily,
        locator: i32,
        pattern: &[T],
        from_pos: u64,
    ) -> SqlResult<i64> {
        tracing::trace!(
            family = family.name(),
            locator = locator,
            pattern_length = pattern.len(),
            from_pos = from_pos,
            "position"
        );
        let first_len = pattern.len().min(VARCHAR_MAXWIDTH);
        let (first, rest) = pattern.split_at(first_len);
        let mut from = from_pos;
        let mut total_length: Option<u64> = None;

        'search: loop {
            let found = self.position_call(family, locator, T::to_value(first), from)?;
            if found < 1 {
                return Ok(-1);
            }
            let mut expected = found as u64 + first_len as u64;
            for chunk in rest.chunks(VARCHAR_MAXWIDTH) {
                let at = self.position_call(family, locator, T::to_value(chunk), expected)?;
                if at != expected as i64 {
                    let length = match total_length {
                        Some(length) => length,
                        None => {
                            let length = self.get_length(family, locator)?;
                            total_length = Some(length);
                            length
                        }
                    };
                    from = found as u64 + 1;
                    if from + pattern.len() as u64 > length {
                        return Ok(-1);
                    }
                    tracing::trace!(restart = from, "Pattern continuation mismatch, restarting");
                    continue 'search;
                }
                expected += chunk.len() as u64;
            }
            return Ok(found);
        }
    }
}

fn not_found_as_minus_one(position: i64) -> i64 {
    if position < 1 {
        -1
    } else {
        position
    }
}

/// Report a server-side invalid locator as an invalid LOB
fn invalid_locator(e: SqlException) -> SqlException {
    if is_invalid_locator(&e) {
        SqlException::client(MessageId::LobObjectInvalid, Vec::<String>::new()).with_cause(e)
    } else {
        e
    }
}
