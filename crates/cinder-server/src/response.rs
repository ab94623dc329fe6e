//! Response writing.
//!
//! [`ResponseWriter`] enforces the call-sequence contract of a reply: a
//! handler either announces a stream of `n` values up front, writes exactly
//! one value, or writes nothing and lets the flush produce `+OK`. Replies
//! are encoded into a per-request buffer and hit the socket once, on flush.
//!
//! [`ReplyWriter`] is what handlers actually receive. When the engine
//! answered some commands of the batch itself (currently `PING`), the
//! wrapper splices those prepared values between the handler's writes so
//! the wire still carries one reply per command, in command order.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use cinder_protocol::{write_array_header, Frame};

use crate::connection::{ConnState, Connection, HijackedConn};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    None,
    OneShot,
    Stream,
}

/// Builds one response and writes it to the connection on flush.
pub struct ResponseWriter {
    conn: Option<Arc<Connection>>,
    mode: WriteMode,
    remain: usize,
    out: BytesMut,
}

impl ResponseWriter {
    pub(crate) fn new(conn: Arc<Connection>) -> ResponseWriter {
        ResponseWriter {
            conn: Some(conn),
            mode: WriteMode::None,
            remain: 0,
            out: BytesMut::new(),
        }
    }

    /// Announces that exactly `n` values will be written.
    ///
    /// `n >= 2` opens an array frame; a single-value stream goes out bare,
    /// so a one-command batch answers `+PONG\r\n` rather than a one-element
    /// array. Cannot be called twice, or after `write`.
    pub fn write_stream(&mut self, n: i64) -> Result<()> {
        if self.conn.is_none() {
            return Err(Error::Hijacked);
        }
        if n < 0 {
            return Err(Error::NegativeStreamCount);
        }
        match self.mode {
            WriteMode::OneShot => Err(Error::WriteStreamCalledAfterWrite),
            WriteMode::Stream => Err(Error::WriteStreamCalledTooManyTimes),
            WriteMode::None => {
                self.mode = WriteMode::Stream;
                self.remain = n as usize;
                if n != 1 {
                    write_array_header(self.remain, &mut self.out);
                }
                Ok(())
            }
        }
    }

    /// Encodes one value of the response.
    ///
    /// Without a preceding `write_stream` this starts a one-shot response,
    /// after which any further write is an error.
    pub fn write(&mut self, value: impl Into<Frame>) -> Result<()> {
        if self.conn.is_none() {
            return Err(Error::Hijacked);
        }
        if self.mode == WriteMode::None {
            self.mode = WriteMode::OneShot;
            self.remain = 1;
        }
        if self.remain == 0 {
            return Err(Error::WriteCalledTooManyTimes);
        }
        self.remain -= 1;
        value.into().serialize(&mut self.out);
        Ok(())
    }

    /// Sends the buffered response to the client.
    ///
    /// A writer nothing was written to produces `+OK`. Flushing before the
    /// announced stream count was reached is an error.
    pub async fn flush(&mut self) -> Result<()> {
        if self.conn.is_none() {
            return Err(Error::Hijacked);
        }
        if self.mode == WriteMode::None {
            self.write("OK")?;
        }
        if self.remain != 0 {
            return Err(Error::WriteCalledNotEnoughTimes);
        }

        let conn = self.conn.clone().ok_or(Error::Hijacked)?;
        let at = conn.write_deadline();
        let mut writer = conn.writer.lock().await;
        writer.buf.extend_from_slice(&self.out);
        self.out.clear();
        writer.flush(at).await
    }

    /// Takes over the raw byte stream.
    ///
    /// The connection is captured and marked `Hijacked` before the writer's
    /// own reference is cleared; from then on every operation on this writer
    /// returns `Error::Hijacked` and the server is done with the connection.
    pub async fn hijack(&mut self) -> Result<HijackedConn> {
        let conn = self.conn.take().ok_or(Error::Hijacked)?;
        conn.set_state(ConnState::Hijacked);
        let mut parts = conn.hijack_parts().await?;
        // hand over anything this writer buffered but never flushed
        parts.write_buf.extend_from_slice(&self.out);
        self.out.clear();
        Ok(parts)
    }
}

/// The writer handed to handlers.
///
/// Wraps the base [`ResponseWriter`]; when prepared `(index, value)` pairs
/// were installed, the total stream count is fixed at wrap time and each
/// handler write first emits the prepared values due at that position.
pub struct ReplyWriter<'a> {
    base: &'a mut ResponseWriter,
    prepared: VecDeque<(usize, Frame)>,
    index: usize,
    interleaved: bool,
}

impl<'a> ReplyWriter<'a> {
    /// A transparent wrapper with no prepared responses.
    pub(crate) fn passthrough(base: &'a mut ResponseWriter) -> ReplyWriter<'a> {
        ReplyWriter {
            base,
            prepared: VecDeque::new(),
            index: 0,
            interleaved: false,
        }
    }

    /// Wraps `base` with prepared responses and opens the stream at the
    /// combined count of handler writes plus prepared values.
    pub(crate) fn with_prepared(
        base: &'a mut ResponseWriter,
        prepared: Vec<(usize, Frame)>,
        total: usize,
    ) -> Result<ReplyWriter<'a>> {
        base.write_stream(total as i64)?;
        Ok(ReplyWriter {
            base,
            prepared: prepared.into(),
            index: 0,
            interleaved: true,
        })
    }

    /// See [`ResponseWriter::write_stream`]. With prepared responses the
    /// stream count is already fixed, so this always errors.
    pub fn write_stream(&mut self, n: i64) -> Result<()> {
        if self.interleaved {
            return Err(Error::WriteStreamCalledTooManyTimes);
        }
        self.base.write_stream(n)
    }

    /// Writes one value, emitting first any prepared values due at the
    /// current position.
    pub fn write(&mut self, value: impl Into<Frame>) -> Result<()> {
        if self.interleaved {
            while let Some((index, _)) = self.prepared.front() {
                if *index != self.index {
                    break;
                }
                if let Some((_, due)) = self.prepared.pop_front() {
                    self.base.write(due)?;
                }
            }
            self.index += 1;
        }
        self.base.write(value)
    }

    /// Sends any buffered data to the client.
    pub async fn flush(&mut self) -> Result<()> {
        self.base.flush().await
    }

    /// Takes over the raw byte stream. See [`ResponseWriter::hijack`].
    pub async fn hijack(&mut self) -> Result<HijackedConn> {
        self.base.hijack().await
    }

    /// Emits the prepared values that come after the handler's last write.
    pub(crate) fn write_remaining(&mut self) -> Result<()> {
        while let Some((_, value)) = self.prepared.pop_front() {
            self.base.write(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn writer_pair() -> (ResponseWriter, Arc<Connection>, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        let conn = Connection::new(
            Box::new(server),
            "client:0".into(),
            "server:0".into(),
            1,
            Weak::new(),
        );
        (ResponseWriter::new(Arc::clone(&conn)), conn, client)
    }

    async fn read_wire(client: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn empty_response_flushes_ok() {
        let (mut res, _conn, mut client) = writer_pair();
        res.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b"+OK\r\n");
    }

    #[tokio::test]
    async fn one_shot_response() {
        let (mut res, _conn, mut client) = writer_pair();
        res.write(1i64).unwrap();
        res.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b":1\r\n");
    }

    #[tokio::test]
    async fn one_shot_rejects_second_write() {
        let (mut res, _conn, _client) = writer_pair();
        res.write("a").unwrap();
        let err = res.write("b").unwrap_err();
        assert!(matches!(err, Error::WriteCalledTooManyTimes));
    }

    #[tokio::test]
    async fn stream_of_two_rejects_third_write() {
        let (mut res, _conn, mut client) = writer_pair();
        res.write_stream(2).unwrap();
        res.write(1i64).unwrap();
        res.write(2i64).unwrap();
        let err = res.write(3i64).unwrap_err();
        assert!(matches!(err, Error::WriteCalledTooManyTimes));

        // the two accepted writes still flush cleanly
        res.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b"*2\r\n:1\r\n:2\r\n");
    }

    #[tokio::test]
    async fn stream_after_write_is_rejected() {
        let (mut res, _conn, _client) = writer_pair();
        res.write("a").unwrap();
        let err = res.write_stream(2).unwrap_err();
        assert!(matches!(err, Error::WriteStreamCalledAfterWrite));
    }

    #[tokio::test]
    async fn double_write_stream_is_rejected() {
        let (mut res, _conn, _client) = writer_pair();
        res.write_stream(2).unwrap();
        let err = res.write_stream(2).unwrap_err();
        assert!(matches!(err, Error::WriteStreamCalledTooManyTimes));
    }

    #[tokio::test]
    async fn negative_stream_count_is_rejected() {
        let (mut res, _conn, _client) = writer_pair();
        let err = res.write_stream(-1).unwrap_err();
        assert!(matches!(err, Error::NegativeStreamCount));
    }

    #[tokio::test]
    async fn flush_before_stream_is_complete_is_rejected() {
        let (mut res, _conn, _client) = writer_pair();
        res.write_stream(2).unwrap();
        res.write(1i64).unwrap();
        let err = res.flush().await.unwrap_err();
        assert!(matches!(err, Error::WriteCalledNotEnoughTimes));
    }

    #[tokio::test]
    async fn single_value_stream_is_unframed() {
        let (mut res, _conn, mut client) = writer_pair();
        res.write_stream(1).unwrap();
        res.write("PONG").unwrap();
        res.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn empty_stream_is_an_empty_array() {
        let (mut res, _conn, mut client) = writer_pair();
        res.write_stream(0).unwrap();
        res.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b"*0\r\n");
    }

    #[tokio::test]
    async fn hijack_disables_the_writer() {
        let (mut res, conn, mut client) = writer_pair();
        res.write("pending").unwrap();

        let mut hijacked = res.hijack().await.unwrap();
        assert_eq!(conn.state(), ConnState::Hijacked);
        assert_eq!(&hijacked.write_buf[..], b"+pending\r\n");

        assert!(matches!(res.write("x").unwrap_err(), Error::Hijacked));
        assert!(matches!(res.write_stream(1).unwrap_err(), Error::Hijacked));
        assert!(matches!(res.flush().await.unwrap_err(), Error::Hijacked));
        assert!(matches!(res.hijack().await.unwrap_err(), Error::Hijacked));

        // the raw stream still reaches the peer
        use tokio::io::AsyncWriteExt;
        hijacked.stream.write_all(b"raw").await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"raw");
    }

    #[tokio::test]
    async fn interleaves_prepared_between_writes() {
        // batch [PING, SET, PING, GET]: prepared at user indices 0 and 1
        let (mut res, _conn, mut client) = writer_pair();
        let prepared = vec![
            (0, Frame::Simple("PONG".into())),
            (1, Frame::Simple("PONG".into())),
        ];
        let mut w = ReplyWriter::with_prepared(&mut res, prepared, 4).unwrap();

        w.write("set-reply").unwrap();
        w.write("get-reply").unwrap();
        w.write_remaining().unwrap();
        w.flush().await.unwrap();

        assert_eq!(
            read_wire(&mut client).await,
            b"*4\r\n+PONG\r\n+set-reply\r\n+PONG\r\n+get-reply\r\n"
        );
    }

    #[tokio::test]
    async fn adjacent_prepared_values_keep_command_order() {
        // batch [PING, PING, SET]: both prepared values precede the write
        let (mut res, _conn, mut client) = writer_pair();
        let prepared = vec![
            (0, Frame::Simple("A".into())),
            (0, Frame::Simple("B".into())),
        ];
        let mut w = ReplyWriter::with_prepared(&mut res, prepared, 3).unwrap();

        w.write("set-reply").unwrap();
        w.write_remaining().unwrap();
        w.flush().await.unwrap();

        assert_eq!(
            read_wire(&mut client).await,
            b"*3\r\n+A\r\n+B\r\n+set-reply\r\n"
        );
    }

    #[tokio::test]
    async fn trailing_prepared_values_are_flushed() {
        // batch [SET, PING]: the prepared value follows the handler's write
        let (mut res, _conn, mut client) = writer_pair();
        let prepared = vec![(1, Frame::Simple("PONG".into()))];
        let mut w = ReplyWriter::with_prepared(&mut res, prepared, 2).unwrap();

        w.write("set-reply").unwrap();
        w.write_remaining().unwrap();
        w.flush().await.unwrap();

        assert_eq!(
            read_wire(&mut client).await,
            b"*2\r\n+set-reply\r\n+PONG\r\n"
        );
    }

    #[tokio::test]
    async fn prepared_wrapper_rejects_write_stream() {
        let (mut res, _conn, _client) = writer_pair();
        let prepared = vec![(0, Frame::Simple("PONG".into()))];
        let mut w = ReplyWriter::with_prepared(&mut res, prepared, 1).unwrap();
        let err = w.write_stream(1).unwrap_err();
        assert!(matches!(err, Error::WriteStreamCalledTooManyTimes));
    }

    #[tokio::test]
    async fn passthrough_wrapper_delegates() {
        let (mut res, _conn, mut client) = writer_pair();
        let mut w = ReplyWriter::passthrough(&mut res);
        w.write_stream(2).unwrap();
        w.write(1i64).unwrap();
        w.write(2i64).unwrap();
        w.flush().await.unwrap();
        assert_eq!(read_wire(&mut client).await, b"*2\r\n:1\r\n:2\r\n");
    }
}
