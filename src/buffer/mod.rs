//! Buffer abstractions for DRDA encoding/decoding
//!
//! This module provides the big-endian buffer types used to read SQLCA
//! groups and DDM replies and to write DDM requests.

mod read;
mod write;

pub use read::ReadBuffer;
pub use write::WriteBuffer;
