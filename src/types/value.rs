//! Parameter and output values
//!
//! [`Value`] is what flows in and out of a statement call. Conversions between
//! variants follow a small conversion table: integers widen freely, narrow
//! only when the value fits, and text or bytes never silently become numbers.

use std::fmt;

use bytes::Bytes;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::exception::{MessageId, SqlException, SqlResult};

/// SQL type of an output parameter or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SqlType {
    /// 16-bit integer
    SmallInt = 0x05,
    /// 32-bit integer
    Integer = 0x03,
    /// 64-bit integer
    BigInt = 0x17,
    /// Variable-length character data
    Varchar = 0x33,
    /// Variable-length binary data
    VarBinary = 0x37,
}

impl SqlType {
    /// Name used in conversion error messages
    pub fn name(self) -> &'static str {
        match self {
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Varchar => "VARCHAR",
            SqlType::VarBinary => "VARCHAR FOR BIT DATA",
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x05 => Some(SqlType::SmallInt),
            0x03 => Some(SqlType::Integer),
            0x17 => Some(SqlType::BigInt),
            0x33 => Some(SqlType::Varchar),
            0x37 => Some(SqlType::VarBinary),
            _ => None,
        }
    }
}

/// A single SQL value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// NULL
    #[default]
    Null,
    /// SMALLINT
    SmallInt(i16),
    /// INTEGER
    Integer(i32),
    /// BIGINT
    BigInt(i64),
    /// VARCHAR
    String(String),
    /// VARCHAR FOR BIT DATA
    Bytes(Vec<u8>),
}

const NULL_INDICATOR: u8 = 0xFF;

impl Value {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL type of this value, `None` for NULL
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Null => None,
            Value::SmallInt(_) => Some(SqlType::SmallInt),
            Value::Integer(_) => Some(SqlType::Integer),
            Value::BigInt(_) => Some(SqlType::BigInt),
            Value::String(_) => Some(SqlType::Varchar),
            Value::Bytes(_) => Some(SqlType::VarBinary),
        }
    }

    /// Integer value widened to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(v) => Some(*v as i64),
            Value::Integer(v) => Some(*v as i64),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value narrowed to i32
    ///
    /// Fails with a range error when the value does not fit. Returns
    /// `Ok(None)` for NULL and non-integer values.
    pub fn to_i32(&self) -> SqlResult<Option<i32>> {
        match self.as_i64() {
            Some(v) => i32::try_from(v).map(Some).map_err(|_| {
                SqlException::client(MessageId::ValueTooLargeForType, [SqlType::Integer.name()])
            }),
            None => Ok(None),
        }
    }

    /// Integer value narrowed to i16
    pub fn to_i16(&self) -> SqlResult<Option<i16>> {
        match self.as_i64() {
            Some(v) => i16::try_from(v).map(Some).map_err(|_| {
                SqlException::client(MessageId::ValueTooLargeForType, [SqlType::SmallInt.name()])
            }),
            None => Ok(None),
        }
    }

    /// String reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte reference
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Take the bytes out, leaving NULL behind
    pub fn take_bytes(&mut self) -> Option<Vec<u8>> {
        match std::mem::take(self) {
            Value::Bytes(b) => Some(b),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Take the string out, leaving NULL behind
    pub fn take_string(&mut self) -> Option<String> {
        match std::mem::take(self) {
            Value::String(s) => Some(s),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Encode as a nullable FD:OCA field: indicator, type tag, data
    pub fn encode(&self, buf: &mut WriteBuffer) {
        match self {
            Value::Null => buf.write_u8(NULL_INDICATOR),
            Value::SmallInt(v) => {
                buf.write_u8(0);
                buf.write_u8(SqlType::SmallInt as u8);
                buf.write_i16(*v);
            }
            Value::Integer(v) => {
                buf.write_u8(0);
                buf.write_u8(SqlType::Integer as u8);
                buf.write_i32(*v);
            }
            Value::BigInt(v) => {
                buf.write_u8(0);
                buf.write_u8(SqlType::BigInt as u8);
                buf.write_i64(*v);
            }
            Value::String(s) => {
                buf.write_u8(0);
                buf.write_u8(SqlType::Varchar as u8);
                buf.write_i32(s.len() as i32);
                buf.write_bytes(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.write_u8(0);
                buf.write_u8(SqlType::VarBinary as u8);
                buf.write_i32(b.len() as i32);
                buf.write_bytes(b);
            }
        }
    }

    /// Decode a field written by [`Value::encode`]
    pub fn decode(buf: &mut ReadBuffer) -> SqlResult<Self> {
        if buf.read_u8()? == NULL_INDICATOR {
            return Ok(Value::Null);
        }
        let tag = buf.read_u8()?;
        let sql_type = SqlType::from_tag(tag)
            .ok_or_else(|| SqlException::protocol(format!("unknown data type 0x{:02X}", tag)))?;
        let value = match sql_type {
            SqlType::SmallInt => Value::SmallInt(buf.read_i16()?),
            SqlType::Integer => Value::Integer(buf.read_i32()?),
            SqlType::BigInt => Value::BigInt(buf.read_i64()?),
            SqlType::Varchar => {
                let data = read_lob_field(buf)?;
                Value::String(String::from_utf8(data.to_vec()).map_err(|_| {
                    SqlException::protocol("character data is not valid UTF-8")
                })?)
            }
            SqlType::VarBinary => Value::Bytes(read_lob_field(buf)?.to_vec()),
        };
        Ok(value)
    }
}

fn read_lob_field(buf: &mut ReadBuffer) -> SqlResult<Bytes> {
    let length = buf.read_i32()?;
    if length < 0 {
        return Err(SqlException::protocol(format!(
            "negative field length {}",
            length
        )));
    }
    buf.read_bytes(length as usize)
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}
