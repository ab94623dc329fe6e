//! Per-connection I/O.
//!
//! A [`Connection`] owns the two halves of a byte stream, each buffered and
//! behind its own async mutex: the read mutex is held while a command's
//! streaming arguments are being consumed, the write mutex while a response
//! is flushed. Handlers that capture the response writer therefore cannot
//! race the server's own reads and writes.
//!
//! tokio sockets have no per-operation deadlines, so the read/write timeouts
//! are kept as deadline cells on the connection and every buffered I/O call
//! runs under `timeout_at` against them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use cinder_protocol::{parse_array_header, parse_frame, Frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{timeout_at, Instant};

use crate::args::{Args, StreamCursor};
use crate::backoff::deadline;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::server::Shared;

/// Initial buffer capacity per direction. 4KB covers most commands
/// comfortably without over-allocating for simple PING/SET workloads.
const BUF_CAPACITY: usize = 4096;

/// Any byte stream a connection can be built over — TCP and Unix sockets
/// both qualify, as do in-memory duplex pipes in tests.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

/// Lifecycle tag of a connection, reported to the `conn_state` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, no request seen yet.
    New = 0,
    /// Currently reading or serving a request.
    Active = 1,
    /// Between requests.
    Idle = 2,
    /// A handler took over the raw stream; the server is no longer involved.
    Hijacked = 3,
    /// Torn down.
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            3 => ConnState::Hijacked,
            _ => ConnState::Closed,
        }
    }
}

/// Set-once close signal shared by both buffered halves so that firing it
/// aborts any in-flight read or write.
#[derive(Clone, Default)]
pub(crate) struct CloseSignal {
    inner: Arc<CloseInner>,
}

#[derive(Default)]
struct CloseInner {
    fired: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub(crate) fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub(crate) async fn fired(&self) {
        while !self.is_fired() {
            let notified = self.inner.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

fn unexpected_eof() -> Error {
    Error::from(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    ))
}

fn deadline_exceeded() -> Error {
    Error::from(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "i/o deadline exceeded",
    ))
}

/// Runs an I/O future under an optional absolute deadline.
async fn io_deadline<T>(
    at: Option<Instant>,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match at {
        Some(at) => match timeout_at(at, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(deadline_exceeded()),
        },
        None => Ok(fut.await?),
    }
}

/// Buffered read half.
pub(crate) struct ConnReader {
    half: Option<ReadHalf<Box<dyn NetStream>>>,
    pub(crate) buf: BytesMut,
    closed: CloseSignal,
}

impl ConnReader {
    fn new(half: ReadHalf<Box<dyn NetStream>>, closed: CloseSignal) -> ConnReader {
        ConnReader {
            half: Some(half),
            buf: BytesMut::with_capacity(BUF_CAPACITY),
            closed,
        }
    }

    /// Reads more bytes into the buffer. Returns the number of bytes read;
    /// zero means the peer closed its half of the stream.
    async fn fill(&mut self, at: Option<Instant>) -> Result<usize> {
        if self.closed.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        let closed = self.closed.clone();
        let half = self.half.as_mut().ok_or(Error::Hijacked)?;
        tokio::select! {
            _ = closed.fired() => Err(Error::ConnectionClosed),
            res = io_deadline(at, half.read_buf(&mut self.buf)) => res,
        }
    }

    /// Resolves once at least one byte is peekable, or errors on timeout,
    /// close, or EOF.
    pub(crate) async fn wait_ready(&mut self, at: Option<Instant>) -> Result<()> {
        while self.buf.is_empty() {
            if self.fill(at).await? == 0 {
                return Err(unexpected_eof());
            }
        }
        Ok(())
    }

    /// Parses one complete frame, reading from the stream as needed.
    pub(crate) async fn read_frame(&mut self, at: Option<Instant>) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = parse_frame(&self.buf).map_err(Error::from)? {
                self.buf.advance(consumed);
                return Ok(frame);
            }
            if self.fill(at).await? == 0 {
                return Err(unexpected_eof());
            }
        }
    }

    /// Parses the `*n\r\n` header that frames a command.
    ///
    /// Returns `Ok(None)` on a clean EOF between commands; an EOF in the
    /// middle of a header is an error.
    pub(crate) async fn read_command_header(
        &mut self,
        at: Option<Instant>,
    ) -> Result<Option<Option<u64>>> {
        loop {
            if let Some((count, consumed)) = parse_array_header(&self.buf).map_err(Error::from)? {
                self.buf.advance(consumed);
                return Ok(Some(count));
            }
            if self.fill(at).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(unexpected_eof());
            }
        }
    }

    fn take_half(&mut self) -> Result<ReadHalf<Box<dyn NetStream>>> {
        self.half.take().ok_or(Error::Hijacked)
    }
}

/// Buffered write half.
pub(crate) struct ConnWriter {
    half: Option<WriteHalf<Box<dyn NetStream>>>,
    pub(crate) buf: BytesMut,
    closed: CloseSignal,
}

impl ConnWriter {
    fn new(half: WriteHalf<Box<dyn NetStream>>, closed: CloseSignal) -> ConnWriter {
        ConnWriter {
            half: Some(half),
            buf: BytesMut::with_capacity(BUF_CAPACITY),
            closed,
        }
    }

    pub(crate) fn encode(&mut self, frame: &Frame) {
        frame.serialize(&mut self.buf);
    }

    /// Writes and flushes everything buffered so far.
    pub(crate) async fn flush(&mut self, at: Option<Instant>) -> Result<()> {
        if self.closed.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        let closed = self.closed.clone();
        let half = self.half.as_mut().ok_or(Error::Hijacked)?;
        let buf = &self.buf;
        let result = tokio::select! {
            _ = closed.fired() => Err(Error::ConnectionClosed),
            res = io_deadline(at, async {
                half.write_all(buf).await?;
                half.flush().await
            }) => res,
        };
        if result.is_ok() {
            self.buf.clear();
        }
        result
    }

    fn take_half(&mut self) -> Result<WriteHalf<Box<dyn NetStream>>> {
        self.half.take().ok_or(Error::Hijacked)
    }
}

/// A raw stream handed back to a handler by a hijack, along with whatever
/// both buffers held at that moment.
pub struct HijackedConn {
    /// The underlying byte stream, reassembled from its two halves.
    pub stream: Box<dyn NetStream>,
    /// Unprocessed bytes already read from the peer.
    pub read_buf: BytesMut,
    /// Response bytes that were buffered but not yet flushed.
    pub write_buf: BytesMut,
}

impl std::fmt::Debug for HijackedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConn")
            .field("read_buf", &self.read_buf)
            .field("write_buf", &self.write_buf)
            .finish()
    }
}

/// One accepted client connection.
pub struct Connection {
    id: u64,
    pub(crate) reader: Arc<AsyncMutex<ConnReader>>,
    pub(crate) writer: Arc<AsyncMutex<ConnWriter>>,
    state: AtomicU8,
    closed: CloseSignal,
    read_deadline: StdMutex<Option<Instant>>,
    write_timeout: StdMutex<Option<Duration>>,
    remote_addr: String,
    local_addr: String,
    shared: Weak<Shared>,
}

impl Connection {
    pub(crate) fn new(
        stream: Box<dyn NetStream>,
        remote_addr: String,
        local_addr: String,
        id: u64,
        shared: Weak<Shared>,
    ) -> Arc<Connection> {
        let closed = CloseSignal::default();
        let (rd, wr) = tokio::io::split(stream);
        Arc::new(Connection {
            id,
            reader: Arc::new(AsyncMutex::new(ConnReader::new(rd, closed.clone()))),
            writer: Arc::new(AsyncMutex::new(ConnWriter::new(wr, closed.clone()))),
            state: AtomicU8::new(ConnState::New as u8),
            closed,
            read_deadline: StdMutex::new(None),
            write_timeout: StdMutex::new(None),
            remote_addr,
            local_addr,
            shared,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The peer address this connection was accepted from.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// The local address the connection arrived on.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.on_conn_state(self, state);
        }
    }

    /// Closes the connection: pending reads and writes abort, the state
    /// moves to `Closed` (unless a handler already hijacked the stream).
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.is_fired() {
            return;
        }
        self.closed.fire();
        if self.state() != ConnState::Hijacked {
            self.set_state(ConnState::Closed);
        }
    }

    /// Whether this connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Sets the absolute deadline for subsequent reads, from a timeout.
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_deadline.lock().unwrap() = deadline(timeout);
    }

    pub(crate) fn read_deadline(&self) -> Option<Instant> {
        *self.read_deadline.lock().unwrap()
    }

    /// Sets the per-flush write timeout.
    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock().unwrap() = timeout;
    }

    pub(crate) fn write_deadline(&self) -> Option<Instant> {
        deadline(*self.write_timeout.lock().unwrap())
    }

    /// Blocks until the first byte of the next request is peekable, or the
    /// idle timeout elapses, or the stream reaches EOF.
    pub(crate) async fn wait_ready_read(&self, idle: Option<Duration>) -> Result<()> {
        let at = deadline(idle);
        let mut reader = self.reader.lock().await;
        reader.wait_ready(at).await
    }

    /// Opens a cursor over the array-framed commands of this connection.
    pub fn read_commands(self: &Arc<Self>, retryable: bool) -> CommandReader {
        CommandReader {
            conn: Arc::clone(self),
            retryable,
            cursor: None,
            done: false,
        }
    }

    /// Encodes the given frames and flushes them. A single frame goes out
    /// bare, which is how `+OK` / `+QUEUED` acknowledgements are written.
    pub(crate) async fn write_frames(&self, frames: &[Frame]) -> Result<()> {
        let at = self.write_deadline();
        let mut writer = self.writer.lock().await;
        for frame in frames {
            writer.encode(frame);
        }
        writer.flush(at).await
    }

    /// Detaches the raw stream for a hijacking handler.
    pub(crate) async fn hijack_parts(&self) -> Result<HijackedConn> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        let rd = reader.take_half()?;
        let wr = match writer.take_half() {
            Ok(wr) => wr,
            Err(e) => {
                // restore the read half so a later close stays consistent
                reader.half = Some(rd);
                return Err(e);
            }
        };
        Ok(HijackedConn {
            stream: rd.unsplit(wr),
            read_buf: std::mem::take(&mut reader.buf),
            write_buf: std::mem::take(&mut writer.buf),
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Drains a command's remaining streamed arguments.
///
/// Keeps reading elements even after an error frame so the wire stays in
/// sync for the next command; I/O and parse failures end the drain because
/// the stream position is no longer trustworthy.
pub(crate) async fn drain_cursor(
    conn: &Connection,
    cursor: &Arc<StdMutex<StreamCursor>>,
) -> Result<()> {
    loop {
        let (remaining, err) = {
            let cur = cursor.lock().unwrap();
            (cur.remaining, cur.err.clone())
        };
        if remaining == 0 {
            return match err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        let at = conn.read_deadline();
        let frame = {
            let mut reader = conn.reader.lock().await;
            reader.read_frame(at).await
        };

        let mut cur = cursor.lock().unwrap();
        match frame {
            Ok(frame) => {
                cur.remaining -= 1;
                if let Frame::Error(msg) = frame {
                    if cur.err.is_none() {
                        cur.err = Some(Error::Reply(msg));
                    }
                }
            }
            Err(e) => {
                cur.remaining = 0;
                let first = cur.err.get_or_insert(e).clone();
                return Err(first);
            }
        }
    }
}

/// Cursor over the commands arriving on one connection.
///
/// Only one command's streaming [`Args`] may be live at a time: `read`
/// first drains whatever is left of the previous command before parsing the
/// next header, and `close` waits for the most recent arguments to finish
/// draining.
pub struct CommandReader {
    conn: Arc<Connection>,
    retryable: bool,
    cursor: Option<Arc<StdMutex<StreamCursor>>>,
    done: bool,
}

impl CommandReader {
    /// Reads the next command.
    ///
    /// Returns `Ok(None)` when the batch ends: on a clean EOF between
    /// commands, or at an `EXEC` terminator (which is consumed and never
    /// surfaced to the caller).
    pub async fn read(&mut self) -> Result<Option<Command>> {
        if self.done {
            return Ok(None);
        }
        self.finish_previous().await?;

        let at = self.conn.read_deadline();
        let header = {
            let mut reader = self.conn.reader.lock().await;
            reader.read_command_header(at).await?
        };
        let count = match header {
            None => {
                self.done = true;
                return Ok(None);
            }
            Some(None) => return Err(Error::InvalidCommand),
            Some(Some(0)) => return Err(Error::InvalidCommand),
            Some(Some(n)) => n,
        };

        let name_frame = {
            let mut reader = self.conn.reader.lock().await;
            reader.read_frame(at).await?
        };
        let name = match name_frame {
            Frame::Bulk(data) => {
                String::from_utf8(data.to_vec()).map_err(|_| Error::InvalidCommand)?
            }
            Frame::Simple(s) => s,
            _ => return Err(Error::InvalidCommand),
        };

        let cursor = Arc::new(StdMutex::new(StreamCursor::new(count - 1)));
        if name.eq_ignore_ascii_case("EXEC") {
            drain_cursor(&self.conn, &cursor).await?;
            self.done = true;
            return Ok(None);
        }

        self.cursor = Some(Arc::clone(&cursor));
        let mut cmd = Command::new(name, Args::stream(Arc::clone(&self.conn), cursor));
        if self.retryable {
            // materialise up front so the command can be replayed
            cmd.load_byte_args().await;
        }
        Ok(Some(cmd))
    }

    async fn finish_previous(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(cursor) => drain_cursor(&self.conn, &cursor).await,
            None => Ok(()),
        }
    }

    /// Waits for the most recent command's arguments to finish draining and
    /// returns the first error seen on the stream.
    pub async fn close(&mut self) -> Result<()> {
        let res = self.finish_previous().await;
        self.done = true;
        res
    }
}
