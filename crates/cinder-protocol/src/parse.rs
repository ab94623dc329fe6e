//! Single-pass RESP parser.
//!
//! Operates on buffered byte slices. The caller is responsible for reading
//! data from the network into a buffer — this parser is purely synchronous.
//! A `Cursor<&[u8]>` tracks the position through the input without consuming
//! it, so the caller can retry the same bytes once more data arrives.
//!
//! Besides whole-frame parsing there are two streaming entry points:
//! [`peek_kind`] reads the wire type from the first byte, and
//! [`parse_array_header`] consumes only the `*n\r\n` header of an array so
//! the caller can decode the `n` elements one at a time as they arrive.
//! That is what lets a server start dispatching a command before its full
//! argument list has reached the socket buffer.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::{Frame, FrameKind};

/// Maximum nesting depth for arrays. Prevents stack overflow from
/// malformed deeply-nested frames.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array. Prevents memory amplification
/// where tiny elements declare disproportionately large allocations.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for `Vec::with_capacity` in array parsing. A declared count of 1M
/// elements would cost a large upfront allocation before any child data is
/// parsed; the Vec still grows organically past this cap.
const PREALLOC_CAP: usize = 1024;

/// Parses one complete frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` if a complete frame was parsed,
/// `Ok(None)` if the buffer doesn't contain enough data yet,
/// or `Err(...)` if the data is malformed.
#[inline]
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);

    match try_parse(&mut cursor, 0) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            Ok(Some((frame, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads the wire type of the next frame from its prefix byte.
///
/// Returns `None` when the buffer is empty. An unknown prefix is reported
/// by the subsequent decode, not here.
#[inline]
pub fn peek_kind(buf: &[u8]) -> Option<FrameKind> {
    buf.first().and_then(|&b| FrameKind::from_prefix(b))
}

/// Parses only an array header `*n\r\n` from the front of `buf`.
///
/// Returns `Ok(Some((count, consumed)))` once the header is complete, where
/// `count` is `None` for the null array (`*-1\r\n`). Returns `Ok(None)`
/// when more bytes are needed. The caller is expected to follow up with
/// `count` individual [`parse_frame`] calls for the elements.
pub fn parse_array_header(buf: &[u8]) -> Result<Option<(Option<u64>, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);

    let header = (|| {
        let prefix = read_byte(&mut cursor)?;
        if prefix != b'*' {
            return Err(ProtocolError::InvalidPrefix(prefix));
        }
        let count = read_integer_line(&mut cursor)?;
        match count {
            -1 => Ok(None),
            n if n < 0 => Err(ProtocolError::InvalidFrameLength(n)),
            n if n as usize > MAX_ARRAY_ELEMENTS => {
                Err(ProtocolError::TooManyElements(n as usize))
            }
            n => Ok(Some(n as u64)),
        }
    })();

    match header {
        Ok(count) => Ok(Some((count, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// single-pass parser: validates and builds Frame values in one traversal
// ---------------------------------------------------------------------------

/// Parses a complete frame from the cursor position, returning `Incomplete`
/// if the buffer doesn't contain enough data.
fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::InvalidUtf8("simple string"))?;
            Ok(Frame::Simple(s.to_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            let s =
                std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8("error"))?;
            Ok(Frame::Error(s.to_owned()))
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Frame::Integer(val))
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                // null bulk string carries no payload
                return Ok(Frame::Null);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len as usize));
            }
            let len = len as usize;

            // need `len` bytes of data + \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;

            // verify trailing \r\n (scope the borrow so we can mutate cursor after)
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::InvalidFrameLength(len as i64));
                }
            }

            cursor.set_position((pos + len + 2) as u64);

            let data = Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]);
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::Null);
            }
            if count < 0 {
                return Err(ProtocolError::InvalidFrameLength(count));
            }
            if count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::TooManyElements(count as usize));
            }

            let count = count as usize;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, next_depth)?);
            }
            Ok(Frame::Array(frames))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(cursor.get_ref()[pos])
}

/// Returns the slice of bytes up to (but not including) the next `\r\n`,
/// and advances the cursor past the `\r\n`.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok(&cursor.get_ref()[start..end])
}

/// Reads a line and parses it as an i64.
fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    parse_i64_bytes(line)
}

/// Finds the next `\r\n` in the buffer starting from the cursor position.
/// Returns the index of `\r` and advances the cursor past the `\n`.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    // memchr scans for \r far faster than a byte-at-a-time loop; verify
    // the \n follows before accepting.
    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // bare \r without \n — keep scanning past it
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len();
    let pos = cursor.position() as usize;
    len.saturating_sub(pos)
}

/// Parses an i64 directly from a byte slice without allocating a String.
///
/// Negative numbers are accumulated in the negative direction so that
/// `i64::MIN` is representable without overflow.
fn parse_i64_bytes(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    if negative {
        let mut n: i64 = 0;
        for &b in digits {
            if !b.is_ascii_digit() {
                return Err(ProtocolError::InvalidInteger);
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_sub((b - b'0') as i64))
                .ok_or(ProtocolError::InvalidInteger)?;
        }
        Ok(n)
    } else {
        let mut n: i64 = 0;
        for &b in digits {
            if !b.is_ascii_digit() {
                return Err(ProtocolError::InvalidInteger);
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as i64))
                .ok_or(ProtocolError::InvalidInteger)?;
        }
        Ok(n)
    }
}
