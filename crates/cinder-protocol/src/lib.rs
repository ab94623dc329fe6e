//! cinder-protocol: RESP wire protocol implementation.
//!
//! Provides single-pass parsing and direct-to-buffer serialization of the
//! RESP protocol used for client-server communication, plus streaming entry
//! points (`peek_kind`, `parse_array_header`) that let a server decode a
//! command's arguments lazily as bytes arrive.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{parse_frame, Frame};
//!
//! // parse a simple string
//! let input = b"+OK\r\n";
//! let (frame, consumed) = parse_frame(input).unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//! assert_eq!(consumed, input.len());
//!
//! // serialize a frame
//! let mut buf = BytesMut::new();
//! frame.serialize(&mut buf);
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_array_header, parse_frame, peek_kind};
pub use serialize::write_array_header;
pub use types::{Frame, FrameKind};
