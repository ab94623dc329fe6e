//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Bulk strings
//! use `Bytes` for reference-counted storage so argument payloads can move
//! through the server without copies.

use bytes::Bytes;

/// A single RESP protocol frame.
///
/// Covers the classic RESP types: simple strings, errors, integers, bulk
/// (binary-safe) strings, arrays, and the null bulk string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string, e.g. `+OK\r\n`. Short, non-binary status replies.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Null, encoded as the null bulk string `$-1\r\n`.
    Null,
}

/// The wire type of a frame, read from its first byte without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Simple,
    Error,
    Integer,
    Bulk,
    Array,
}

impl FrameKind {
    /// Maps a RESP type prefix byte to its kind.
    pub fn from_prefix(prefix: u8) -> Option<FrameKind> {
        match prefix {
            b'+' => Some(FrameKind::Simple),
            b'-' => Some(FrameKind::Error),
            b':' => Some(FrameKind::Integer),
            b'$' => Some(FrameKind::Bulk),
            b'*' => Some(FrameKind::Array),
            _ => None,
        }
    }
}

impl Frame {
    /// Returns `true` if this frame is the null bulk string.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Frame {
        Frame::Simple(s.to_owned())
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Frame {
        Frame::Simple(s)
    }
}

impl From<i64> for Frame {
    fn from(n: i64) -> Frame {
        Frame::Integer(n)
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Frame {
        Frame::Bulk(data)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Frame {
        Frame::Bulk(Bytes::from(data))
    }
}

impl From<&[u8]> for Frame {
    fn from(data: &[u8]) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(data))
    }
}
