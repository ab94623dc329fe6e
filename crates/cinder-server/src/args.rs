//! Lazy argument streams.
//!
//! [`Args`] is the list of arguments of one command. It is a closed sum type
//! because every variant is defined here: arguments can stream straight off
//! the wire, sit in memory as frames or raw bytes, chain several lists, or
//! carry a terminal error. The consuming code stays agnostic of the source.
//!
//! The contract, for every variant: values are consumed exactly once;
//! `next` is safe to call past the end; the first decode or transport error
//! ends the sequence and is reported by `close`, which also drains whatever
//! was left unread so the connection's wire position stays valid.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use cinder_protocol::Frame;

use crate::connection::{drain_cursor, Connection};
use crate::error::{Error, Result};

/// Progress of one command's streamed argument tail, shared between the
/// argument list and the command reader so the reader can verify the tail
/// was fully consumed before parsing the next command.
pub(crate) struct StreamCursor {
    pub(crate) remaining: u64,
    pub(crate) err: Option<Error>,
}

impl StreamCursor {
    pub(crate) fn new(remaining: u64) -> StreamCursor {
        StreamCursor {
            remaining,
            err: None,
        }
    }
}

/// A value that can be decoded from one command argument.
///
/// This is the statically-typed face of the argument stream: instead of
/// decoding into a runtime-typed destination, callers ask for the type they
/// want and get `None` when the argument cannot be coerced.
pub trait FromArg: Sized + Send {
    /// Decodes from a parsed frame (streamed or in-memory arguments).
    fn from_frame(frame: Frame) -> Result<Self>;

    /// Decodes from a raw byte argument (materialised arguments).
    fn from_bytes(data: Bytes) -> Result<Self>;
}

fn parse_text<T: std::str::FromStr>(data: &[u8], what: &str) -> Result<T> {
    let s = std::str::from_utf8(data)
        .map_err(|_| Error::ArgDecode(format!("invalid utf-8 in {what} argument")))?;
    s.parse()
        .map_err(|_| Error::ArgDecode(format!("cannot parse {s:?} as {what}")))
}

impl FromArg for i64 {
    fn from_frame(frame: Frame) -> Result<i64> {
        match frame {
            Frame::Integer(n) => Ok(n),
            Frame::Bulk(b) => Self::from_bytes(b),
            Frame::Simple(s) => parse_text(s.as_bytes(), "integer"),
            other => Err(unexpected(&other, "integer")),
        }
    }

    fn from_bytes(data: Bytes) -> Result<i64> {
        parse_text(&data, "integer")
    }
}

impl FromArg for u64 {
    fn from_frame(frame: Frame) -> Result<u64> {
        match frame {
            Frame::Integer(n) => {
                u64::try_from(n).map_err(|_| Error::ArgDecode(format!("{n} is negative")))
            }
            Frame::Bulk(b) => Self::from_bytes(b),
            Frame::Simple(s) => parse_text(s.as_bytes(), "unsigned integer"),
            other => Err(unexpected(&other, "unsigned integer")),
        }
    }

    fn from_bytes(data: Bytes) -> Result<u64> {
        parse_text(&data, "unsigned integer")
    }
}

impl FromArg for f64 {
    fn from_frame(frame: Frame) -> Result<f64> {
        match frame {
            Frame::Integer(n) => Ok(n as f64),
            Frame::Bulk(b) => Self::from_bytes(b),
            Frame::Simple(s) => parse_text(s.as_bytes(), "float"),
            other => Err(unexpected(&other, "float")),
        }
    }

    fn from_bytes(data: Bytes) -> Result<f64> {
        parse_text(&data, "float")
    }
}

// booleans travel as integers on the wire; anything non-zero is true
impl FromArg for bool {
    fn from_frame(frame: Frame) -> Result<bool> {
        i64::from_frame(frame).map(|n| n != 0)
    }

    fn from_bytes(data: Bytes) -> Result<bool> {
        i64::from_bytes(data).map(|n| n != 0)
    }
}

impl FromArg for String {
    fn from_frame(frame: Frame) -> Result<String> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(b) => Self::from_bytes(b),
            Frame::Integer(n) => Ok(n.to_string()),
            Frame::Null => Ok(String::new()),
            other => Err(unexpected(&other, "string")),
        }
    }

    fn from_bytes(data: Bytes) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|_| Error::ArgDecode("invalid utf-8 in string argument".into()))
    }
}

impl FromArg for Bytes {
    fn from_frame(frame: Frame) -> Result<Bytes> {
        match frame {
            Frame::Bulk(b) => Ok(b),
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Integer(n) => Ok(Bytes::from(n.to_string().into_bytes())),
            Frame::Null => Ok(Bytes::new()),
            other => Err(unexpected(&other, "bytes")),
        }
    }

    fn from_bytes(data: Bytes) -> Result<Bytes> {
        Ok(data)
    }
}

impl FromArg for Vec<u8> {
    fn from_frame(frame: Frame) -> Result<Vec<u8>> {
        Bytes::from_frame(frame).map(|b| b.to_vec())
    }

    fn from_bytes(data: Bytes) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

// opaque destination: the raw frame itself
impl FromArg for Frame {
    fn from_frame(frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    fn from_bytes(data: Bytes) -> Result<Frame> {
        Ok(Frame::Bulk(data))
    }
}

fn unexpected(frame: &Frame, wanted: &str) -> Error {
    let got = match frame {
        Frame::Simple(_) => "simple string",
        Frame::Error(_) => "error",
        Frame::Integer(_) => "integer",
        Frame::Bulk(_) => "bulk string",
        Frame::Array(_) => "array",
        Frame::Null => "null",
    };
    Error::ArgDecode(format!("cannot decode {got} frame as {wanted}"))
}

/// A list of arguments in requests and responses.
pub enum Args {
    /// Streaming lazily from a connection's read buffer.
    Stream(StreamArgs),
    /// In-memory frames, from [`Args::list`].
    List(ListArgs),
    /// Materialised raw byte arguments.
    Bytes(ByteArgs),
    /// Several argument lists consumed back to back.
    Multi(MultiArgs),
    /// A terminal error carrier.
    Error(ErrorArgs),
}

impl Args {
    /// Creates an argument list from a sequence of values.
    pub fn list<I, V>(values: I) -> Args
    where
        I: IntoIterator<Item = V>,
        V: Into<Frame>,
    {
        Args::List(ListArgs {
            items: values.into_iter().map(Into::into).collect(),
            err: None,
        })
    }

    /// Creates an argument list over raw byte arguments.
    pub fn bytes<I>(values: I) -> Args
    where
        I: IntoIterator<Item = Bytes>,
    {
        Args::Bytes(ByteArgs {
            items: values.into_iter().collect(),
            err: None,
        })
    }

    /// Chains several argument lists into one sequence.
    pub fn multi(parts: Vec<Args>) -> Args {
        Args::Multi(MultiArgs {
            parts,
            index: 0,
            err: None,
        })
    }

    /// Creates a terminal argument list that only reports `err`.
    pub fn error(err: Error) -> Args {
        Args::Error(ErrorArgs { err })
    }

    pub(crate) fn stream(conn: Arc<Connection>, cursor: Arc<StdMutex<StreamCursor>>) -> Args {
        Args::Stream(StreamArgs { conn, cursor })
    }

    /// Remaining number of values; zero once an error occurred.
    pub fn len(&self) -> usize {
        match self {
            Args::Stream(a) => a.len(),
            Args::List(a) => a.len(),
            Args::Bytes(a) => a.len(),
            Args::Multi(a) => a.len(),
            Args::Error(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the next value.
    ///
    /// Returns `None` at the end of the sequence and after any error; the
    /// error itself is reported by [`Args::close`].
    ///
    /// Boxed explicitly (rather than `async fn`) because `Args::Multi`
    /// recurses into this same method: an `async fn` here would give the
    /// compiler a self-referential opaque type whose `Send`-ness it can't
    /// resolve.
    pub fn next<T: FromArg>(&mut self) -> BoxedNext<'_, T> {
        Box::pin(async move {
            match self {
                Args::Stream(a) => a.next().await,
                Args::List(a) => a.next(),
                Args::Bytes(a) => a.next(),
                Args::Multi(a) => a.next().await,
                Args::Error(_) => None,
            }
        })
    }

    /// Drains any remaining values and returns the first error seen.
    /// Idempotent: closing again reports the same outcome.
    ///
    /// Boxed for the same reason as [`Args::next`]: `Args::Multi` recurses
    /// into this method.
    pub fn close(&mut self) -> BoxedClose<'_> {
        Box::pin(async move {
            match self {
                Args::Stream(a) => a.close().await,
                Args::List(a) => a.close(),
                Args::Bytes(a) => a.close(),
                Args::Multi(a) => a.close().await,
                Args::Error(a) => Err(a.err.clone()),
            }
        })
    }
}

impl Default for Args {
    /// An empty, already-exhausted argument list.
    fn default() -> Args {
        Args::bytes([])
    }
}

/// Arguments streaming lazily from the wire.
///
/// Holds the connection so each decode can take the read mutex for exactly
/// one element; the shared cursor keeps the command reader honest about how
/// much of the tail is left.
pub struct StreamArgs {
    conn: Arc<Connection>,
    cursor: Arc<StdMutex<StreamCursor>>,
}

impl StreamArgs {
    fn len(&self) -> usize {
        let cur = self.cursor.lock().unwrap();
        if cur.err.is_some() {
            0
        } else {
            cur.remaining as usize
        }
    }

    async fn next<T: FromArg>(&mut self) -> Option<T> {
        {
            let cur = self.cursor.lock().unwrap();
            if cur.err.is_some() || cur.remaining == 0 {
                return None;
            }
        }

        let at = self.conn.read_deadline();
        let res = {
            let mut reader = self.conn.reader.lock().await;
            reader.read_frame(at).await
        };

        let mut cur = self.cursor.lock().unwrap();
        let frame = match res {
            Ok(frame) => {
                cur.remaining -= 1;
                frame
            }
            Err(e) => {
                cur.remaining = 0;
                cur.err = Some(e);
                return None;
            }
        };

        if let Frame::Error(msg) = frame {
            cur.err = Some(Error::Reply(msg));
            return None;
        }

        match T::from_frame(frame) {
            Ok(value) => Some(value),
            Err(e) => {
                cur.err = Some(e);
                None
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        drain_cursor(&self.conn, &self.cursor).await
    }
}

/// In-memory frame arguments.
pub struct ListArgs {
    items: VecDeque<Frame>,
    err: Option<Error>,
}

impl ListArgs {
    fn len(&self) -> usize {
        if self.err.is_some() {
            0
        } else {
            self.items.len()
        }
    }

    fn next<T: FromArg>(&mut self) -> Option<T> {
        if self.err.is_some() {
            return None;
        }
        let frame = self.items.pop_front()?;
        if let Frame::Error(msg) = frame {
            self.err = Some(Error::Reply(msg));
            return None;
        }
        match T::from_frame(frame) {
            Ok(value) => Some(value),
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        // draining still surfaces error frames that were never reached
        for frame in self.items.drain(..) {
            if let Frame::Error(msg) = frame {
                if self.err.is_none() {
                    self.err = Some(Error::Reply(msg));
                }
            }
        }
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Materialised raw byte arguments.
pub struct ByteArgs {
    items: VecDeque<Bytes>,
    err: Option<Error>,
}

impl ByteArgs {
    fn len(&self) -> usize {
        if self.err.is_some() {
            0
        } else {
            self.items.len()
        }
    }

    fn next<T: FromArg>(&mut self) -> Option<T> {
        if self.err.is_some() {
            return None;
        }
        let data = self.items.pop_front()?;
        match T::from_bytes(data) {
            Ok(value) => Some(value),
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.items.clear();
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

type BoxedNext<'a, T> = Pin<Box<dyn Future<Output = Option<T>> + Send + 'a>>;
type BoxedClose<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Values produced sequentially from several argument lists.
pub struct MultiArgs {
    parts: Vec<Args>,
    index: usize,
    err: Option<Error>,
}

impl MultiArgs {
    fn len(&self) -> usize {
        if self.err.is_some() {
            return 0;
        }
        self.parts.iter().skip(self.index).map(Args::len).sum()
    }

    async fn next<T: FromArg>(&mut self) -> Option<T> {
        if self.err.is_some() {
            return None;
        }
        while let Some(part) = self.parts.get_mut(self.index) {
            // recursion through the Args enum needs a boxed future
            let fut: BoxedNext<'_, T> = Box::pin(part.next::<T>());
            if let Some(value) = fut.await {
                return Some(value);
            }
            // the inner list is exhausted or failed; closing tells us which
            let close: BoxedClose<'_> = Box::pin(part.close());
            if let Err(e) = close.await {
                self.err = Some(e);
                return None;
            }
            self.index += 1;
        }
        None
    }

    async fn close(&mut self) -> Result<()> {
        let mut first = None;
        for part in &mut self.parts {
            let close: BoxedClose<'_> = Box::pin(part.close());
            if let Err(e) = close.await {
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        if let Some(e) = &self.err {
            first = Some(e.clone());
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Terminal error carrier with nothing to consume.
pub struct ErrorArgs {
    err: Error,
}

/// The argument lists of a transaction, one per queued command.
///
/// Closing drains every child list and detaches from the connection. An
/// error frame sent by the peer is reported but leaves the connection
/// usable; any other failure closes the connection and wins over earlier
/// protocol errors.
pub struct TxArgs {
    conn: Option<Arc<Connection>>,
    queue: VecDeque<Args>,
    err: Option<Error>,
}

impl TxArgs {
    /// Binds the per-command argument lists of a transaction to the
    /// connection they were read from.
    pub fn new(conn: Arc<Connection>, parts: Vec<Args>) -> TxArgs {
        TxArgs {
            conn: Some(conn),
            queue: parts.into(),
            err: None,
        }
    }

    /// A terminal transaction result that only reports `err`.
    pub fn error(err: Error) -> TxArgs {
        TxArgs {
            conn: None,
            queue: VecDeque::new(),
            err: Some(err),
        }
    }

    /// Number of argument lists remaining to consume.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The next command's argument list, or `None` once all were consumed.
    ///
    /// The returned list must be closed before this `TxArgs` is used again.
    pub fn next(&mut self) -> Option<Args> {
        if self.err.is_some() {
            return None;
        }
        self.queue.pop_front()
    }

    /// Drains all remaining children and reports the first error.
    pub async fn close(&mut self) -> Result<()> {
        while let Some(mut args) = self.queue.pop_front() {
            if let Err(e) = args.close().await {
                if self.err.is_none() {
                    self.err = Some(e.clone());
                }
                if !e.is_reply() {
                    if let Some(conn) = &self.conn {
                        conn.close();
                    }
                    // fatal errors always win over protocol errors
                    self.err = Some(e);
                }
            }
        }
        self.conn = None;
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Parses a single integer argument and closes the list.
pub async fn int(args: &mut Args) -> Result<i64> {
    let value = args.next::<i64>().await;
    args.close().await?;
    value.ok_or_else(|| Error::ArgDecode("missing integer argument".into()))
}

/// Parses a single string argument and closes the list.
pub async fn string(args: &mut Args) -> Result<String> {
    let value = args.next::<String>().await;
    args.close().await?;
    value.ok_or_else(|| Error::ArgDecode("missing string argument".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_typed_extraction() {
        let mut args = Args::list([
            Frame::Bulk(Bytes::from_static(b"foo")),
            Frame::Integer(42),
            Frame::Bulk(Bytes::from_static(b"2.5")),
        ]);
        assert_eq!(args.len(), 3);

        let key: String = args.next().await.unwrap();
        assert_eq!(key, "foo");
        let n: i64 = args.next().await.unwrap();
        assert_eq!(n, 42);
        let f: f64 = args.next().await.unwrap();
        assert!((f - 2.5).abs() < f64::EPSILON);

        assert_eq!(args.len(), 0);
        assert_eq!(args.next::<String>().await, None);
        args.close().await.unwrap();
    }

    #[tokio::test]
    async fn byte_args_coercions() {
        let mut args = Args::bytes([
            Bytes::from_static(b"1"),
            Bytes::from_static(b"-7"),
            Bytes::from_static(b"12"),
            Bytes::from_static(b"3.25"),
            Bytes::from_static(b"hello"),
        ]);

        assert!(args.next::<bool>().await.unwrap());
        assert_eq!(args.next::<i64>().await.unwrap(), -7);
        assert_eq!(args.next::<u64>().await.unwrap(), 12);
        assert!((args.next::<f64>().await.unwrap() - 3.25).abs() < f64::EPSILON);
        assert_eq!(args.next::<String>().await.unwrap(), "hello");
        args.close().await.unwrap();
    }

    #[tokio::test]
    async fn byte_args_decode_failure_ends_the_sequence() {
        let mut args = Args::bytes([Bytes::from_static(b"abc"), Bytes::from_static(b"1")]);

        assert_eq!(args.next::<i64>().await, None);
        assert_eq!(args.len(), 0, "len is zero after an error");
        assert_eq!(args.next::<i64>().await, None, "safe to call past the error");

        let err = args.close().await.unwrap_err();
        assert!(matches!(err, Error::ArgDecode(_)), "got {err:?}");
        // idempotent: the same error again
        let err = args.close().await.unwrap_err();
        assert!(matches!(err, Error::ArgDecode(_)));
    }

    #[tokio::test]
    async fn inline_error_frame_stops_iteration() {
        let mut args = Args::list([
            Frame::Bulk(Bytes::from_static(b"ok")),
            Frame::Error("ERR mid-stream".into()),
            Frame::Bulk(Bytes::from_static(b"never")),
        ]);

        assert_eq!(args.next::<String>().await.unwrap(), "ok");
        assert_eq!(args.next::<String>().await, None);

        let err = args.close().await.unwrap_err();
        assert!(matches!(err, Error::Reply(ref m) if m == "ERR mid-stream"));
    }

    #[tokio::test]
    async fn multi_args_sequences_parts() {
        let mut args = Args::multi(vec![
            Args::list([Frame::Integer(1), Frame::Integer(2)]),
            Args::bytes([Bytes::from_static(b"3")]),
        ]);
        assert_eq!(args.len(), 3);

        for want in 1i64..=3 {
            assert_eq!(args.next::<i64>().await.unwrap(), want);
        }
        assert_eq!(args.next::<i64>().await, None);
        args.close().await.unwrap();
    }

    #[tokio::test]
    async fn multi_args_surfaces_inner_error() {
        let mut args = Args::multi(vec![
            Args::list([Frame::Integer(1)]),
            Args::error(Error::Reply("ERR inner".into())),
            Args::list([Frame::Integer(3)]),
        ]);

        assert_eq!(args.next::<i64>().await.unwrap(), 1);
        // the error carrier ends iteration when it is reached
        assert_eq!(args.next::<i64>().await, None);

        let err = args.close().await.unwrap_err();
        assert!(matches!(err, Error::Reply(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn error_args_is_terminal() {
        let mut args = Args::error(Error::NilArgs);
        assert_eq!(args.len(), 0);
        assert_eq!(args.next::<String>().await, None);
        assert!(matches!(args.close().await.unwrap_err(), Error::NilArgs));
    }

    #[tokio::test]
    async fn opaque_frames_pass_through() {
        let mut args = Args::list([Frame::Array(vec![Frame::Integer(1)])]);
        let frame: Frame = args.next().await.unwrap();
        assert_eq!(frame, Frame::Array(vec![Frame::Integer(1)]));
    }

    #[tokio::test]
    async fn int_and_string_helpers() {
        let mut args = Args::list([Frame::Integer(42)]);
        assert_eq!(int(&mut args).await.unwrap(), 42);

        let mut args = Args::list([Frame::Bulk(Bytes::from_static(b"hi"))]);
        assert_eq!(string(&mut args).await.unwrap(), "hi");

        let mut empty = Args::list(Vec::<Frame>::new());
        assert!(int(&mut empty).await.is_err());
    }

    mod tx {
        use super::*;
        use std::sync::Weak;

        fn closed_probe() -> (Arc<Connection>, Arc<Connection>) {
            let (server, _client) = tokio::io::duplex(64);
            let conn = Connection::new(
                Box::new(server),
                "client:0".into(),
                "server:0".into(),
                7,
                Weak::new(),
            );
            (Arc::clone(&conn), conn)
        }

        #[tokio::test]
        async fn reply_error_is_not_fatal() {
            let (conn, probe) = closed_probe();
            let mut tx = TxArgs::new(
                conn,
                vec![
                    Args::list([Frame::Integer(1)]),
                    Args::error(Error::Reply("ERR busy".into())),
                ],
            );

            assert_eq!(tx.len(), 2);
            let mut first = tx.next().unwrap();
            assert_eq!(first.next::<i64>().await.unwrap(), 1);
            first.close().await.unwrap();

            let err = tx.close().await.unwrap_err();
            assert!(matches!(err, Error::Reply(_)));
            assert!(!probe.is_closed(), "protocol errors keep the connection");
        }

        #[tokio::test]
        async fn fatal_error_closes_the_connection() {
            let (conn, probe) = closed_probe();
            let mut tx = TxArgs::new(
                conn,
                vec![
                    Args::error(Error::Reply("ERR first".into())),
                    Args::error(Error::ConnectionClosed),
                ],
            );

            let err = tx.close().await.unwrap_err();
            // the fatal error wins over the earlier protocol error
            assert!(matches!(err, Error::ConnectionClosed), "got {err:?}");
            assert!(probe.is_closed());
        }

        #[tokio::test]
        async fn error_carrier() {
            let mut tx = TxArgs::error(Error::NotPipeline);
            assert_eq!(tx.len(), 0);
            assert!(tx.next().is_none());
            assert!(matches!(tx.close().await.unwrap_err(), Error::NotPipeline));
        }
    }
}
