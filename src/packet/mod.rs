//! DSS framing
//!
//! This module handles the data stream structure layer: the 6-byte header
//! and the splitting of payloads larger than one segment.

mod header;

pub use header::{DssHeader, CONTINUATION_BIT};

use bytes::Bytes;

use crate::buffer::WriteBuffer;
use crate::constants::{DSS_HEADER_SIZE, DSS_MAX_LENGTH};

/// Size of the length prefix on continuation segments
pub const CONTINUATION_HEADER_SIZE: usize = 2;

/// A complete DSS with header and reassembled payload
#[derive(Debug, Clone)]
pub struct Dss {
    /// Header of the first segment
    pub header: DssHeader,
    /// The DDM objects carried by the DSS
    pub payload: Bytes,
}

impl Dss {
    /// Create a new DSS
    pub fn new(dss_type: u8, correlation_id: u16, payload: Bytes) -> Self {
        let length = (payload.len() + DSS_HEADER_SIZE).min(DSS_MAX_LENGTH) as u16;
        Self {
            header: DssHeader::new(dss_type, length, correlation_id),
            payload,
        }
    }

    /// Mark whether another DSS follows in the chain
    pub fn chained(mut self, chained: bool) -> Self {
        self.header = self.header.with_chained(chained);
        self
    }

    /// Encode with continuation segments where the payload needs them
    pub fn encode(&self) -> Bytes {
        let first_room = DSS_MAX_LENGTH - DSS_HEADER_SIZE;
        let next_room = DSS_MAX_LENGTH - CONTINUATION_HEADER_SIZE;
        let mut buf = WriteBuffer::with_capacity(self.payload.len() + 16);

        let first = self.payload.len().min(first_room);
        let mut rest = &self.payload[first..];
        let mut header = self.header;
        header.length = (first + DSS_HEADER_SIZE) as u16;
        header.continued = !rest.is_empty();
        header.write(&mut buf);
        buf.write_bytes(&self.payload[..first]);

        while !rest.is_empty() {
            let take = rest.len().min(next_room);
            let mut length = (take + CONTINUATION_HEADER_SIZE) as u16;
            if rest.len() > take {
                length |= CONTINUATION_BIT;
            }
            buf.write_u16(length);
            buf.write_bytes(&rest[..take]);
            rest = &rest[take..];
        }
        buf.freeze()
    }

    /// DSS type
    pub fn dss_type(&self) -> u8 {
        self.header.dss_type()
    }

    /// Correlation id
    pub fn correlation_id(&self) -> u16 {
        self.header.correlation_id
    }
}
