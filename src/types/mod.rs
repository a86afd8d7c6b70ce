//! SQL values and large objects
//!
//! This module provides [`Value`], the parameter and result representation
//! used by statement calls, and the [`Blob`] and [`Clob`] large object types.
//! A large object either holds its value on the client (in memory or as a
//! caller supplied stream) or refers to a server-side locator.

mod value;
mod lob;
mod blob;
mod clob;

pub use value::{SqlType, Value};
pub use lob::{materialize_stream, ChunkedBytes};
pub use blob::{Blob, BlobReader, BlobWriter};
pub use clob::{Clob, ClobReader, ClobWriter};
