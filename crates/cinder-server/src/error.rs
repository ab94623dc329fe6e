//! Error types for the server core.
//!
//! Contract violations on the response writer and lifecycle sentinels are
//! plain enum variants so callers can match on them; transport failures wrap
//! `std::io::Error`. The enum is `Clone` (I/O errors behind an `Arc`) because
//! an argument stream reports the same stored error from every `close` call.

use std::sync::Arc;

use cinder_protocol::ProtocolError;
use thiserror::Error;

/// Errors produced by the server core.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Canonical return of `serve` after `close` or `shutdown`.
    #[error("redis: server closed")]
    ServerClosed,

    /// The connection has been taken over by a handler; the writer (and any
    /// later operation on it) is unusable.
    #[error("redis: the connection has been hijacked")]
    Hijacked,

    /// The response writer does not support hijacking.
    #[error("redis: the response writer is not hijackable")]
    NotHijackable,

    /// Values were requested from an absent argument list.
    #[error("redis: cannot parse values from a nil argument list")]
    NilArgs,

    /// `write_stream` was called with a negative count.
    #[error("redis: call to write_stream with a negative stream count")]
    NegativeStreamCount,

    /// `write_stream` was called after `write` had already begun a one-shot
    /// response.
    #[error("redis: call to write_stream after write")]
    WriteStreamCalledAfterWrite,

    /// `write_stream` was called more than once.
    #[error("redis: multiple calls to write_stream")]
    WriteStreamCalledTooManyTimes,

    /// `write` was called more times than the announced stream count.
    #[error("redis: too many calls to write")]
    WriteCalledTooManyTimes,

    /// The response was flushed before the announced stream count was
    /// reached.
    #[error("redis: not enough calls to write")]
    WriteCalledNotEnoughTimes,

    /// Sentinel meaning "this command produces no follow-up command"; the
    /// pipeline pass filters it, it never reaches the error log.
    #[error("redis: command does not produce a follow-up command")]
    NotPipeline,

    /// The connection was closed while an operation was in flight.
    #[error("redis: connection closed")]
    ConnectionClosed,

    /// `shutdown` gave up with listeners or connections still outstanding.
    #[error("redis: shutdown deadline expired with actors outstanding")]
    ShutdownTimeout,

    /// A command frame was not an array of strings.
    #[error("redis: invalid command frame")]
    InvalidCommand,

    /// An argument could not be coerced into the requested type.
    #[error("redis: cannot decode command argument: {0}")]
    ArgDecode(String),

    /// The peer sent an error frame where a value was expected.
    #[error("{0}")]
    Reply(String),

    /// Malformed RESP on the wire.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Returns `true` for errors that are expected control flow and are
    /// filtered from the error log.
    pub(crate) fn is_filtered(&self) -> bool {
        matches!(self, Error::Hijacked | Error::NotPipeline)
    }

    /// Returns `true` when this error is an error frame sent by the peer —
    /// the protocol kept working, so the connection survives it.
    pub(crate) fn is_reply(&self) -> bool {
        matches!(self, Error::Reply(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_errors() {
        assert!(Error::Hijacked.is_filtered());
        assert!(Error::NotPipeline.is_filtered());
        assert!(!Error::ServerClosed.is_filtered());
        assert!(!Error::WriteCalledTooManyTimes.is_filtered());
    }

    #[test]
    fn reply_errors() {
        assert!(Error::Reply("ERR nope".into()).is_reply());
        assert!(!Error::ConnectionClosed.is_reply());
    }

    #[test]
    fn io_errors_clone() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        let cloned = err.clone();
        assert!(matches!(cloned, Error::Io(_)));
    }
}
