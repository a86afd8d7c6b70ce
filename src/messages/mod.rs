//! DDM messages
//!
//! Typed requests and replies exchanged with the server, and their encoding
//! as DDM objects. A DDM object is a 2-byte length, a 2-byte code point and
//! a body made of nested parameters or raw data.

mod reply;
mod request;

pub use reply::Reply;
pub use request::{Credentials, Request};

use bytes::Bytes;

use crate::buffer::ReadBuffer;
use crate::exception::{SqlException, SqlResult};

/// Length of a DDM object header
pub const DDM_HEADER_SIZE: usize = 4;

/// One decoded DDM object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdmObject {
    /// Code point
    pub code_point: u16,
    /// Body without the header
    pub body: Bytes,
}

impl DdmObject {
    /// Parameters nested in the body
    pub fn params(&self) -> SqlResult<Vec<DdmObject>> {
        read_objects(self.body.clone())
    }

    /// First nested parameter with `code_point`
    pub fn param(&self, code_point: u16) -> SqlResult<Option<DdmObject>> {
        Ok(self
            .params()?
            .into_iter()
            .find(|p| p.code_point == code_point))
    }

    /// Body as a big-endian u16
    pub fn as_u16(&self) -> SqlResult<u16> {
        ReadBuffer::new(self.body.clone()).read_u16()
    }

    /// Body decoded as text
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).trim_end().to_string()
    }
}

/// Split a byte run into consecutive DDM objects
pub fn read_objects(data: Bytes) -> SqlResult<Vec<DdmObject>> {
    let mut buf = ReadBuffer::new(data);
    let mut objects = Vec::new();
    while buf.remaining() > 0 {
        let length = buf.read_u16()? as usize;
        let code_point = buf.read_u16()?;
        if length < DDM_HEADER_SIZE {
            return Err(SqlException::protocol(format!(
                "DDM object 0x{:04X} has invalid length {}",
                code_point, length
            )));
        }
        let body = buf.read_bytes(length - DDM_HEADER_SIZE)?;
        objects.push(DdmObject { code_point, body });
    }
    Ok(objects)
}
