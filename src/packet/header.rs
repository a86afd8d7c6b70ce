//! DSS header encoding/decoding
//!
//! Every data stream structure starts with a 6-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! |   Length (2)    | Magic  | Format |  Correlator (2) |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! The magic byte is always `0xD0`. The format byte carries the DSS type in
//! its low nibble and the chaining flags in the high nibble. When the high
//! bit of the length is set, the DSS continues in further segments that each
//! start with a 2-byte length of their own.

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::constants::{dss_flag, DSS_HEADER_SIZE, DSS_MAGIC};
use crate::exception::{SqlException, SqlResult};

/// Bit of the length field marking a continued DSS
pub const CONTINUATION_BIT: u16 = 0x8000;

/// DSS header (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssHeader {
    /// Length of this segment including the header
    pub length: u16,
    /// DSS type and chaining flags
    pub format: u8,
    /// Request correlation id
    pub correlation_id: u16,
    /// Whether continuation segments follow
    pub continued: bool,
}

impl DssHeader {
    /// Create a header for a segment of `length` bytes
    pub fn new(dss_type: u8, length: u16, correlation_id: u16) -> Self {
        Self {
            length,
            format: dss_type & 0x0F,
            correlation_id,
            continued: false,
        }
    }

    /// Set or clear the chained flag
    pub fn with_chained(mut self, chained: bool) -> Self {
        if chained {
            self.format |= dss_flag::CHAINED;
        } else {
            self.format &= !dss_flag::CHAINED;
        }
        self
    }

    /// DSS type from the low nibble
    pub fn dss_type(&self) -> u8 {
        self.format & 0x0F
    }

    /// Whether another DSS follows in the same chain
    pub fn is_chained(&self) -> bool {
        self.format & dss_flag::CHAINED != 0
    }

    /// Payload bytes carried by this segment
    pub fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(DSS_HEADER_SIZE)
    }

    /// Parse a header from raw bytes
    pub fn parse(data: &[u8]) -> SqlResult<Self> {
        if data.len() < DSS_HEADER_SIZE {
            return Err(SqlException::protocol(format!(
                "DSS header too short: {} bytes",
                data.len()
            )));
        }
        Self::read(&mut ReadBuffer::from_slice(data))
    }

    /// Read a header from a buffer
    pub fn read(buf: &mut ReadBuffer) -> SqlResult<Self> {
        let raw_length = buf.read_u16()?;
        let magic = buf.read_u8()?;
        if magic != DSS_MAGIC {
            return Err(SqlException::protocol(format!(
                "invalid DSS magic 0x{:02X}",
                magic
            )));
        }
        let format = buf.read_u8()?;
        let correlation_id = buf.read_u16()?;
        let length = raw_length & !CONTINUATION_BIT;
        if (length as usize) < DSS_HEADER_SIZE {
            return Err(SqlException::protocol(format!(
                "DSS length {} shorter than its header",
                length
            )));
        }
        Ok(Self {
            length,
            format,
            correlation_id,
            continued: raw_length & CONTINUATION_BIT != 0,
        })
    }

    /// Write the header to a buffer
    pub fn write(&self, buf: &mut WriteBuffer) {
        let mut length = self.length;
        if self.continued {
            length |= CONTINUATION_BIT;
        }
        buf.write_u16(length);
        buf.write_u8(DSS_MAGIC);
        buf.write_u8(self.format);
        buf.write_u16(self.correlation_id);
    }
}
