//! Write buffer for encoding DRDA data
//!
//! Provides methods for writing big-endian integers, length-prefixed strings
//! and DDM objects whose length is patched once the body is complete.

use bytes::{BufMut, Bytes, BytesMut};

/// A buffer for writing DRDA protocol data
#[derive(Debug)]
pub struct WriteBuffer {
    /// The underlying byte buffer
    data: BytesMut,
    /// Start offsets of DDM objects still waiting for their length
    open_objects: Vec<usize>,
}

impl WriteBuffer {
    /// Create a new WriteBuffer with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new WriteBuffer with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            open_objects: Vec::new(),
        }
    }

    /// Get the current length of data in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get a view of the written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the buffer into immutable bytes
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Write a single byte
    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a big-endian u16
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    /// Write a big-endian i16
    pub fn write_i16(&mut self, value: i16) {
        self.data.put_i16(value);
    }

    /// Write a big-endian i32
    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32(value);
    }

    /// Write a big-endian i64
    pub fn write_i64(&mut self, value: i64) {
        self.data.put_i64(value);
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Write a `u16` length-prefixed byte string
    ///
    /// Longer input is cut at `u16::MAX` bytes.
    pub fn write_vcs(&mut self, bytes: &[u8]) {
        let length = bytes.len().min(u16::MAX as usize);
        self.write_u16(length as u16);
        self.write_bytes(&bytes[..length]);
    }

    /// Write a fixed-width character field, space padded or cut to `width`
    pub fn write_fixed_string(&mut self, value: &str, width: usize) {
        let bytes = value.as_bytes();
        let used = bytes.len().min(width);
        self.write_bytes(&bytes[..used]);
        for _ in used..width {
            self.write_u8(b' ');
        }
    }

    /// Begin a DDM object: a 2-byte length placeholder and the code point
    pub fn begin_ddm(&mut self, code_point: u16) {
        self.open_objects.push(self.data.len());
        self.write_u16(0);
        self.write_u16(code_point);
    }

    /// Finish the innermost open DDM object by patching its length
    pub fn end_ddm(&mut self) {
        if let Some(start) = self.open_objects.pop() {
            let length = (self.data.len() - start).min(u16::MAX as usize) as u16;
            self.data[start..start + 2].copy_from_slice(&length.to_be_bytes());
        }
    }

    /// Write a complete DDM parameter with a raw payload
    pub fn write_ddm_param(&mut self, code_point: u16, payload: &[u8]) {
        self.begin_ddm(code_point);
        self.write_bytes(payload);
        self.end_ddm();
    }

    /// Write a DDM parameter holding a big-endian u16
    pub fn write_ddm_u16(&mut self, code_point: u16, value: u16) {
        self.write_ddm_param(code_point, &value.to_be_bytes());
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
