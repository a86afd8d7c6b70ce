//! Read buffer for decoding DRDA data
//!
//! Provides methods for reading big-endian integers and length-prefixed
//! strings from a byte buffer, following the DDM and FD:OCA conventions.

use bytes::Bytes;

use crate::exception::{SqlException, SqlResult};

/// A buffer for reading DRDA protocol data
#[derive(Debug)]
pub struct ReadBuffer {
    /// The underlying byte data
    data: Bytes,
    /// Current read position
    pos: usize,
}

impl ReadBuffer {
    /// Create a new ReadBuffer from bytes
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    /// Create a new ReadBuffer from a byte slice
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            pos: 0,
        }
    }

    /// Get the current position in the buffer
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to be read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if there are at least `n` bytes remaining
    #[inline]
    pub fn has_remaining(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    /// Skip `n` bytes in the buffer
    pub fn skip(&mut self, n: usize) -> SqlResult<()> {
        self.ensure_remaining(n)?;
        self.pos += n;
        Ok(())
    }

    fn ensure_remaining(&self, n: usize) -> SqlResult<()> {
        if self.remaining() < n {
            return Err(SqlException::protocol(format!(
                "buffer underflow: need {} bytes but only {} available",
                n,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Peek at the next byte without advancing
    pub fn peek_u8(&self) -> SqlResult<u8> {
        self.ensure_remaining(1)?;
        Ok(self.data[self.pos])
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> SqlResult<u8> {
        let value = self.peek_u8()?;
        self.pos += 1;
        Ok(value)
    }

    /// Read a big-endian u16
    pub fn read_u16(&mut self) -> SqlResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a big-endian i16
    pub fn read_i16(&mut self) -> SqlResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Read a big-endian u32
    pub fn read_u32(&mut self) -> SqlResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian i32
    pub fn read_i32(&mut self) -> SqlResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a big-endian i64
    pub fn read_i64(&mut self) -> SqlResult<i64> {
        let high = self.read_u32()? as u64;
        let low = self.read_u32()? as u64;
        Ok(((high << 32) | low) as i64)
    }

    /// Read `n` bytes as a zero-copy slice of the buffer
    pub fn read_bytes(&mut self, n: usize) -> SqlResult<Bytes> {
        self.ensure_remaining(n)?;
        let bytes = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(bytes)
    }

    /// Read `n` bytes into a new vector
    pub fn read_bytes_vec(&mut self, n: usize) -> SqlResult<Vec<u8>> {
        Ok(self.read_bytes(n)?.to_vec())
    }

    /// Read everything left in the buffer
    pub fn read_remaining(&mut self) -> Bytes {
        let bytes = self.data.slice(self.pos..);
        self.pos = self.data.len();
        bytes
    }

    /// Read a fixed-width character field, lossily decoded as UTF-8
    pub fn read_fixed_string(&mut self, n: usize) -> SqlResult<String> {
        let bytes = self.read_bytes(n)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a `u16` length-prefixed byte string (VCS/VCM layout)
    pub fn read_vcs(&mut self) -> SqlResult<Bytes> {
        let length = self.read_u16()? as usize;
        self.read_bytes(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_big_endian() {
        let mut buf = ReadBuffer::from_slice(&[0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFE, 0x00]);
        assert_eq!(buf.read_u16().unwrap(), 0x0102);
        assert_eq!(buf.read_i32().unwrap(), -2);
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn test_read_vcs() {
        let mut buf = ReadBuffer::from_slice(&[0x00, 0x03, b'a', b'b', b'c', 0x09]);
        assert_eq!(&buf.read_vcs().unwrap()[..], b"abc");
        assert_eq!(buf.read_u8().unwrap(), 0x09);
    }

    #[test]
    fn test_underflow_is_protocol_error() {
        let mut buf = ReadBuffer::from_slice(&[0x00]);
        let err = buf.read_u32().unwrap_err();
        assert_eq!(err.sql_state(), "58009");
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_read_i64() {
        let mut buf = ReadBuffer::from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(buf.read_i64().unwrap(), (1i64 << 32) | 2);
    }
}
