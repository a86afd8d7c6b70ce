//! Server diagnostics (SQLCA)
//!
//! A [`Diagnostic`] holds the SQL communications area returned with a reply:
//! SQLCODE, SQLSTATE, the raw message tokens, the product signature, the six
//! SQLERRD integers and the eleven SQLWARN flags.
//!
//! # Wire layout
//!
//! ```text
//! SQLCAGRP   indicator(1) SQLCODE(4) SQLSTATE(5) SQLERRPROC(8) SQLCAXGRP SQLDIAGGRP
//! SQLCAXGRP  indicator(1) SQLERRD(6 x 4) SQLWARN(11) RDBNAME(vcs) SQLERRMC(vcm) SQLERRMC(vcs)
//! ```
//!
//! An indicator of `0xFF` means the group is null. Only the indicator, code
//! and state are mandatory; everything after them falls back to defaults when
//! it is missing or truncated.
//!
//! Human readable text is produced lazily by [`Diagnostic::message`]. When a
//! live session allows it, the text comes from the server's message
//! formatting procedure and is cached on the record.

use bytes::Bytes;
use once_cell::sync::OnceCell;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::constants::{sql_state, SQLERRMC_MESSAGE_DELIMITER, SQLERRMC_TOKEN_DELIMITER};
use crate::exception::{MessageId, SqlException, SqlResult};

/// Null indicator value for FD:OCA groups
const NULL_DATA: u8 = 0xFF;

/// Width of the SQLERRPROC field
const PRODUCT_ID_WIDTH: usize = 8;

/// Number of SQLWARN flags
pub const WARNING_FLAG_COUNT: usize = 11;

/// Session-side hooks used to turn a diagnostic into readable text
///
/// Implemented by the session agent. [`Unformatted`] is the stand-in used
/// when no session is available.
pub trait MessageFormatter {
    /// Whether a formatting round trip may be attempted right now
    fn can_format(&self) -> bool;

    /// Run the server message procedure for `diagnostic`
    ///
    /// Returns `Ok(None)` when the procedure ran but reported a non-zero
    /// return code.
    fn format(&mut self, diagnostic: &Diagnostic) -> SqlResult<Option<String>>;

    /// Record a non-fatal warning on the session
    fn warn(&mut self, warning: SqlException);

    /// Store an exception that cannot be thrown from the current context
    fn defer(&mut self, exception: SqlException);
}

/// Formatter that never contacts a server
#[derive(Debug, Default, Clone, Copy)]
pub struct Unformatted;

impl MessageFormatter for Unformatted {
    fn can_format(&self) -> bool {
        false
    }

    fn format(&mut self, _diagnostic: &Diagnostic) -> SqlResult<Option<String>> {
        Ok(None)
    }

    fn warn(&mut self, _warning: SqlException) {}

    fn defer(&mut self, _exception: SqlException) {}
}

/// SQL communications area received from the server
#[derive(Debug)]
pub struct Diagnostic {
    code: i32,
    state: String,
    product_id: Option<String>,
    errd: [i32; 6],
    warnings: [u8; WARNING_FLAG_COUNT],
    rdb_name: Option<String>,
    tokens: Vec<u8>,
    formatted: OnceCell<String>,
    next: Option<Box<Diagnostic>>,
}

impl Diagnostic {
    /// Create a diagnostic with the mandatory fields and defaults elsewhere
    pub fn new(code: i32, state: impl Into<String>) -> Self {
        Self {
            code,
            state: state.into(),
            product_id: None,
            errd: [0; 6],
            warnings: [b' '; WARNING_FLAG_COUNT],
            rdb_name: None,
            tokens: Vec::new(),
            formatted: OnceCell::new(),
            next: None,
        }
    }

    /// A successful, empty diagnostic
    pub fn success() -> Self {
        Self::new(0, sql_state::SUCCESS)
    }

    /// Set the message tokens, joined with the token delimiter
    pub fn with_tokens<S: AsRef<str>>(mut self, tokens: &[S]) -> Self {
        let mut raw = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            if i > 0 {
                raw.push(SQLERRMC_TOKEN_DELIMITER);
            }
            raw.extend_from_slice(token.as_ref().as_bytes());
        }
        self.tokens = raw;
        self
    }

    /// Set the raw SQLERRMC bytes
    pub fn with_raw_tokens(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.tokens = raw.into();
        self
    }

    /// Set the product signature
    pub fn with_product_id(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    /// Set the SQLERRD integers
    pub fn with_errd(mut self, errd: [i32; 6]) -> Self {
        self.errd = errd;
        self
    }

    /// Parse an SQLCAGRP
    ///
    /// Fails only when the indicator, SQLCODE or SQLSTATE cannot be read.
    pub fn from_wire(data: &[u8]) -> SqlResult<Self> {
        let mut buf = ReadBuffer::from_slice(data);

        let indicator = buf
            .read_u8()
            .map_err(|_| SqlException::protocol("SQLCA is empty"))?;
        if indicator == NULL_DATA {
            return Ok(Self::success());
        }

        let code = buf
            .read_i32()
            .map_err(|_| SqlException::protocol("SQLCA is missing SQLCODE"))?;
        let state_bytes = buf
            .read_bytes(5)
            .map_err(|_| SqlException::protocol("SQLCA is missing SQLSTATE"))?;
        let state = std::str::from_utf8(&state_bytes)
            .map_err(|_| SqlException::protocol("SQLSTATE is not valid character data"))?
            .to_string();

        let mut diagnostic = Self::new(code, state);
        diagnostic.product_id = buf
            .read_fixed_string(PRODUCT_ID_WIDTH)
            .ok()
            .map(|s| s.trim_end().to_string())
            .filter(|s| !s.is_empty());

        if let Err(e) = diagnostic.read_extension(&mut buf) {
            tracing::trace!(
                sqlcode = code,
                reason = %e,
                "SQLCAXGRP incomplete, keeping defaults"
            );
        }

        diagnostic.split_chained_messages();
        Ok(diagnostic)
    }

    fn read_extension(&mut self, buf: &mut ReadBuffer) -> SqlResult<()> {
        if buf.read_u8()? == NULL_DATA {
            return Ok(());
        }

        let mut errd = [0i32; 6];
        for slot in errd.iter_mut() {
            *slot = buf.read_i32()?;
        }
        self.errd = errd;

        let warnings = buf.read_bytes(WARNING_FLAG_COUNT)?;
        self.warnings.copy_from_slice(&warnings);

        let rdb_name = buf.read_vcs()?;
        if !rdb_name.is_empty() {
            self.rdb_name = Some(String::from_utf8_lossy(&rdb_name).trim_end().to_string());
        }

        let mixed = buf.read_vcs()?;
        let single = if buf.has_remaining(2) {
            buf.read_vcs()?
        } else {
            Bytes::new()
        };
        self.tokens = if mixed.is_empty() {
            single.to_vec()
        } else {
            mixed.to_vec()
        };
        Ok(())
    }

    /// Split `STATE:tokens` segments appended after the message delimiter
    /// into linked diagnostics
    fn split_chained_messages(&mut self) {
        let mut segments = split_on(&self.tokens, SQLERRMC_MESSAGE_DELIMITER);
        if segments.len() < 2 {
            return;
        }
        let first = segments.remove(0);
        let mut chained = Vec::new();
        for segment in segments {
            if segment.len() < 6 || segment[5] != b':' {
                continue;
            }
            let state = String::from_utf8_lossy(&segment[..5]).into_owned();
            chained.push(Self::new(self.code, state).with_raw_tokens(segment[6..].to_vec()));
        }
        self.tokens = first;
        for record in chained.into_iter().rev() {
            let mut record = record;
            record.next = self.next.take();
            self.next = Some(Box::new(record));
        }
    }

    /// Encode as an SQLCAGRP (SQLAM 7 layout)
    pub fn to_wire(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(64 + self.tokens.len());
        buf.write_u8(0);
        buf.write_i32(self.code);
        buf.write_fixed_string(&self.state, 5);
        buf.write_fixed_string(self.product_id.as_deref().unwrap_or(""), PRODUCT_ID_WIDTH);
        buf.write_u8(0);
        for value in self.errd {
            buf.write_i32(value);
        }
        buf.write_bytes(&self.warnings);
        buf.write_vcs(self.rdb_name.as_deref().unwrap_or("").as_bytes());
        buf.write_vcs(&self.raw_tokens_with_chain());
        buf.write_vcs(&[]);
        buf.write_u8(NULL_DATA);
        buf.freeze()
    }

    fn raw_tokens_with_chain(&self) -> Vec<u8> {
        let mut raw = self.tokens.clone();
        let mut next = self.next.as_deref();
        while let Some(record) = next {
            raw.extend_from_slice(SQLERRMC_MESSAGE_DELIMITER);
            raw.extend_from_slice(record.state.as_bytes());
            raw.push(b':');
            raw.extend_from_slice(&record.tokens);
            next = record.next.as_deref();
        }
        raw
    }

    /// SQLCODE: negative for errors, positive for warnings
    pub fn code(&self) -> i32 {
        self.code
    }

    /// SQLSTATE
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Product signature (SQLERRPROC)
    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    /// The six SQLERRD integers
    pub fn errd(&self) -> &[i32; 6] {
        &self.errd
    }

    /// Relational database name, when sent
    pub fn rdb_name(&self) -> Option<&str> {
        self.rdb_name.as_deref()
    }

    /// The eleven SQLWARN flags as a string
    pub fn warning_flags(&self) -> String {
        String::from_utf8_lossy(&self.warnings).into_owned()
    }

    /// Row count carried in SQLERRD1 and SQLERRD2
    pub fn row_count(&self) -> i64 {
        ((self.errd[0] as i64) << 32) | (self.errd[1] as u32 as i64)
    }

    /// Update count carried in SQLERRD3
    pub fn update_count(&self) -> i32 {
        self.errd[2]
    }

    /// Whether this diagnostic reports an error
    pub fn is_error(&self) -> bool {
        self.code < 0
    }

    /// Whether this diagnostic reports a warning
    pub fn is_warning(&self) -> bool {
        self.code > 0
    }

    /// Raw SQLERRMC bytes
    pub fn raw_tokens(&self) -> &[u8] {
        &self.tokens
    }

    /// SQLERRMC decoded as text, delimiters included
    pub fn token_string(&self) -> String {
        String::from_utf8_lossy(&self.tokens).into_owned()
    }

    /// Message tokens
    ///
    /// A field that is exactly one delimiter yields a single empty token; an
    /// empty field yields no tokens.
    pub fn tokens(&self) -> Vec<String> {
        split_tokens(&self.tokens)
    }

    /// Next diagnostic in a server-generated chain
    pub fn next(&self) -> Option<&Diagnostic> {
        self.next.as_deref()
    }

    /// Detach the rest of the chain
    pub(crate) fn take_next(&mut self) -> Option<Box<Diagnostic>> {
        self.next.take()
    }

    /// Message built from the tokens alone, without a server round trip
    pub fn unformatted_message(&self) -> String {
        format!(
            "SQL error: SQLCODE: {}, SQLSTATE: {}, SQLERRMC: {}",
            self.code,
            self.state,
            self.tokens().join(" ")
        )
    }

    /// Human readable message
    ///
    /// The first successful formatting is cached. When `formatter` cannot
    /// reach a live session the token-only text is returned. If the
    /// formatting call itself fails, a warning explaining why is recorded
    /// through `formatter` and the token-only text is returned.
    pub fn message(&self, formatter: &mut dyn MessageFormatter) -> String {
        if let Some(text) = self.formatted.get() {
            return text.clone();
        }
        if !formatter.can_format() {
            return self.unformatted_message();
        }

        match formatter.format(self) {
            Ok(Some(text)) => self.formatted.get_or_init(|| text).clone(),
            Ok(None) => self
                .formatted
                .get_or_init(|| self.unformatted_message())
                .clone(),
            Err(e) => {
                let reason = if e.is_procedure_not_found() {
                    MessageId::MessageProcedureMissing
                } else {
                    MessageId::MessageTextUnavailable
                };
                tracing::warn!(
                    sqlcode = self.code,
                    failure_state = e.sql_state(),
                    "Message formatting failed, using message tokens"
                );
                let warning = SqlException::client(reason, Vec::<String>::new());
                if e.is_chain_breaking() {
                    formatter.warn(warning);
                    formatter.defer(e);
                } else {
                    formatter.warn(warning.with_next(e));
                }
                self.unformatted_message()
            }
        }
    }
}

fn split_on(data: &[u8], delimiter: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + delimiter.len() <= data.len() {
        if &data[i..i + delimiter.len()] == delimiter {
            parts.push(data[start..i].to_vec());
            i += delimiter.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(data[start..].to_vec());
    parts
}

/// Split SQLERRMC into tokens
pub fn split_tokens(raw: &[u8]) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    if raw == [SQLERRMC_TOKEN_DELIMITER] {
        return vec![String::new()];
    }
    raw.split(|b| *b == SQLERRMC_TOKEN_DELIMITER)
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect()
}
