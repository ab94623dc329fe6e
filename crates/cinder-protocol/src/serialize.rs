//! RESP serialization.
//!
//! Every wire form is a prefixed line, so encoding funnels through two
//! helpers: `put_line` for payloads carried verbatim and `put_number` for
//! the decimal headers (`itoa` keeps the integer formatting off the heap).
//! Frames serialize straight into the caller's `BytesMut`.

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

const CRLF: &[u8] = b"\r\n";

/// One `<prefix><payload>\r\n` line.
fn put_line(prefix: u8, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + 3);
    dst.put_u8(prefix);
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

/// A prefixed decimal line, used for integers and length headers.
fn put_number(prefix: u8, value: i64, dst: &mut BytesMut) {
    let mut digits = itoa::Buffer::new();
    put_line(prefix, digits.format(value).as_bytes(), dst);
}

impl Frame {
    /// Appends the full wire representation of this frame to `dst`,
    /// type prefix and trailing delimiters included.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(text) => put_line(b'+', text.as_bytes(), dst),
            Frame::Error(message) => put_line(b'-', message.as_bytes(), dst),
            Frame::Integer(value) => put_number(b':', *value, dst),
            Frame::Bulk(payload) => {
                put_number(b'$', payload.len() as i64, dst);
                dst.put_slice(payload);
                dst.put_slice(CRLF);
            }
            Frame::Array(items) => {
                write_array_header(items.len(), dst);
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => put_line(b'$', b"-1", dst),
        }
    }
}

/// Writes an array header `*n\r\n` into the buffer.
///
/// This is the stream-encoding half of the codec: a caller producing `n`
/// values one at a time writes the header once, then serializes each value.
pub fn write_array_header(n: usize, dst: &mut BytesMut) {
    put_number(b'*', n as i64, dst);
}
