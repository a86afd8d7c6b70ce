//! DRDA protocol constants
//!
//! This module contains the code points, SQLSTATE values, security mechanism
//! identifiers and size limits used across the client.

// =============================================================================
// DSS Framing
// =============================================================================

/// DSS header length in bytes
pub const DSS_HEADER_SIZE: usize = 6;

/// Magic byte at offset 2 of every DSS header
pub const DSS_MAGIC: u8 = 0xD0;

/// Maximum length of a single DSS segment (including header)
pub const DSS_MAX_LENGTH: usize = 32767;

/// DSS format types (low nibble of the format byte)
pub mod dss_type {
    /// Request DSS
    pub const REQUEST: u8 = 0x01;
    /// Reply DSS
    pub const REPLY: u8 = 0x02;
    /// Object DSS
    pub const OBJECT: u8 = 0x03;
}

/// DSS format flags (high nibble of the format byte)
pub mod dss_flag {
    /// Another DSS follows in the same chain
    pub const CHAINED: u8 = 0x40;
    /// Continue on error
    pub const CONTINUE_ON_ERROR: u8 = 0x20;
    /// Next DSS uses the same correlation id
    pub const SAME_CORRELATOR: u8 = 0x10;
}

// =============================================================================
// DDM Code Points
// =============================================================================

/// DDM command, reply and parameter code points
pub mod code_point {
    // Commands
    /// Exchange Server Attributes
    pub const EXCSAT: u16 = 0x1041;
    /// Access Security
    pub const ACCSEC: u16 = 0x106D;
    /// Security Check
    pub const SECCHK: u16 = 0x106E;
    /// Access RDB
    pub const ACCRDB: u16 = 0x2001;
    /// Execute SQL Statement
    pub const EXCSQLSTT: u16 = 0x200B;
    /// Prepare SQL Statement
    pub const PRPSQLSTT: u16 = 0x200D;
    /// RDB Commit Unit of Work
    pub const RDBCMM: u16 = 0x200E;
    /// RDB Rollback Unit of Work
    pub const RDBRLLBCK: u16 = 0x200F;

    // Replies
    /// Server Attributes Reply Data
    pub const EXCSATRD: u16 = 0x1443;
    /// Access Security Reply Data
    pub const ACCSECRD: u16 = 0x14AC;
    /// Security Check Reply Message
    pub const SECCHKRM: u16 = 0x1219;
    /// Access RDB Reply Message
    pub const ACCRDBRM: u16 = 0x2201;
    /// End Unit of Work Condition
    pub const ENDUOWRM: u16 = 0x220C;
    /// RDB Update Reply Message
    pub const RDBUPDRM: u16 = 0x2218;
    /// SQL Communications Area Reply Data
    pub const SQLCARD: u16 = 0x2408;
    /// SQL Program Variable Data
    pub const SQLDTA: u16 = 0x2412;
    /// Data Reply Data
    pub const SQLDTARD: u16 = 0x2413;
    /// SQL Statement
    pub const SQLSTT: u16 = 0x2414;
    /// FD:OCA Data
    pub const FDODTA: u16 = 0x147A;

    // Parameters
    /// Server Class Name
    pub const SRVCLSNM: u16 = 0x1147;
    /// Severity Code
    pub const SVRCOD: u16 = 0x1149;
    /// Server Product Release Level
    pub const SRVRLSLV: u16 = 0x115A;
    /// External Name
    pub const EXTNAM: u16 = 0x115E;
    /// Server Name
    pub const SRVNAM: u16 = 0x116D;
    /// User ID
    pub const USRID: u16 = 0x11A0;
    /// Password
    pub const PASSWORD: u16 = 0x11A1;
    /// Security Mechanism
    pub const SECMEC: u16 = 0x11A2;
    /// Security Check Code
    pub const SECCHKCD: u16 = 0x11A4;
    /// Security Token
    pub const SECTKN: u16 = 0x11DC;
    /// RDB Name
    pub const RDBNAM: u16 = 0x2110;
    /// Package Section Number
    pub const PKGSN: u16 = 0x210C;
    /// Product-specific Identifier
    pub const PRDID: u16 = 0x112E;
}

// =============================================================================
// Security Mechanisms
// =============================================================================

/// DRDA security mechanism codes (SECMEC)
pub mod secmec {
    /// User id and password in clear text
    pub const USRIDPWD: u16 = 0x03;
    /// User id only
    pub const USRIDONL: u16 = 0x04;
    /// User id with DES-encrypted password
    pub const USRENCPWD: u16 = 0x07;
    /// User id with strong password substitute
    pub const USRSSBPWD: u16 = 0x08;
    /// DES-encrypted user id and password
    pub const EUSRIDPWD: u16 = 0x09;
}

// =============================================================================
// SQLSTATE Values
// =============================================================================

/// SQLSTATE values raised by this client or interpreted from server replies
pub mod sql_state {
    /// Successful completion
    pub const SUCCESS: &str = "00000";
    /// Generic warning
    pub const WARNING: &str = "01000";
    /// Message text could not be retrieved from the server
    pub const MESSAGE_TEXT_UNAVAILABLE: &str = "01J10";
    /// Message formatting procedure is not installed on the server
    pub const MESSAGE_PROCEDURE_MISSING: &str = "01J11";
    /// Security exception encountered
    pub const SECURITY_EXCEPTION: &str = "08001";
    /// No current connection
    pub const NO_CURRENT_CONNECTION: &str = "08003";
    /// Authentication failure
    pub const AUTHENTICATION_FAILED: &str = "08004";
    /// Communication link failure
    pub const DISCONNECT: &str = "08006";
    /// Value outside the range of the data type
    pub const VALUE_TOO_LARGE_FOR_TYPE: &str = "22003";
    /// Routine not found (server side)
    pub const PROCEDURE_NOT_FOUND: &str = "42Y03";
    /// Distribution protocol error
    pub const PROTOCOL_ERROR: &str = "58009";
    /// Zero or negative position
    pub const BLOB_BAD_POSITION: &str = "XJ070";
    /// Negative length
    pub const BLOB_NONPOSITIVE_LENGTH: &str = "XJ071";
    /// Null search pattern
    pub const BLOB_NULL_PATTERN: &str = "XJ072";
    /// LOB already freed
    pub const LOB_FREED: &str = "XJ073";
    /// Position exceeds the LOB size
    pub const BLOB_POSITION_TOO_LARGE: &str = "XJ076";
    /// Offset outside the source array
    pub const BLOB_INVALID_OFFSET: &str = "XJ078";
    /// Length exceeds available source data
    pub const BLOB_LENGTH_TOO_LONG: &str = "XJ079";
    /// Invalid API parameter
    pub const INVALID_API_PARAMETER: &str = "XJ081";
    /// Position plus length exceeds the LOB size
    pub const POS_AND_LENGTH_GREATER_THAN_LOB: &str = "XJ087";
    /// LOB modified under an open stream
    pub const LOB_CHANGED: &str = "XJ088";
    /// Non-atomic batch failure
    pub const BATCH_NON_ATOMIC_FAILURE: &str = "XJ208";
    /// LOB object invalid (closed connection or ended transaction)
    pub const LOB_OBJECT_INVALID: &str = "XJ215";
    /// Invalid locator (server side)
    pub const INVALID_LOCATOR: &str = "XJ217";
    /// I/O failure while reading a stream
    pub const STREAMING_IO: &str = "XCL30";
}

/// Error codes attached to client exceptions (severity based)
pub mod error_code {
    /// Warning severity
    pub const WARNING_SEVERITY: i32 = 10000;
    /// Statement severity
    pub const STATEMENT_SEVERITY: i32 = 20000;
    /// Session severity (disconnect)
    pub const SESSION_SEVERITY: i32 = 40000;
    /// Server SQLCODE for "no routine found"
    pub const PROCEDURE_NOT_FOUND: i32 = -440;
}

// =============================================================================
// Limits and Sentinels
// =============================================================================

/// Largest VARCHAR payload accepted by a single locator procedure call
pub const VARCHAR_MAXWIDTH: usize = 32672;

/// Locator id meaning "no locator could be allocated"
pub const INVALID_LOCATOR: i32 = -1;

/// Update count reported for a batch slot that failed
pub const EXECUTE_FAILED: i64 = -3;

/// Update count reported when the server gives no count for a slot
pub const SUCCESS_NO_INFO: i64 = -2;

/// Separates message tokens inside SQLERRMC
pub const SQLERRMC_TOKEN_DELIMITER: u8 = 0x14;

/// Separates chained messages inside SQLERRMC
pub const SQLERRMC_MESSAGE_DELIMITER: &[u8] = &[0x14, 0x14, 0x14];

/// Chunk size used when materializing a stream into memory
pub const MATERIALIZE_CHUNK_SIZE: usize = 32 * 1024;

/// Maximum representable LOB length
pub const MAX_LOB_LENGTH: u64 = i32::MAX as u64;

/// Text placed in front of a batch-labelled message
pub const BATCH_POSITION_PREFIX: &str = "Error for batch element #";
