//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known RESP type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the frame content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk string declared a length above the 512 MB protocol limit.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    /// An array declared more elements than the parser accepts.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// Arrays nested beyond the parser's depth limit.
    #[error("frame nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A simple string or error frame held non-UTF-8 bytes.
    #[error("invalid utf-8 in {0} frame")]
    InvalidUtf8(&'static str),
}
