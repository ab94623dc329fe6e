//! The server: accept loop, per-connection tasks, command dispatch,
//! transaction buffering, and shutdown.
//!
//! Data flow per connection: wait for the first byte, read one command (or
//! buffer a whole `MULTI` transaction), dispatch the batch to the handler
//! through a response writer, flush, go idle, repeat. Every exit path runs
//! through a drop guard that closes the connection and releases its
//! bookkeeping, so shutdown accounting stays exact even if a handler
//! panics.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use cinder_protocol::Frame;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::backoff::{backoff, deadline};
use crate::command::Command;
use crate::connection::{CommandReader, ConnState, Connection, NetStream};
use crate::error::{Error, Result};
use crate::metrics;
use crate::request::Request;
use crate::response::{ReplyWriter, ResponseWriter};

/// Callback invoked on every connection state change.
pub type ConnStateCallback = Box<dyn Fn(&Connection, ConnState) + Send + Sync>;

/// The user-supplied request handler.
///
/// Invoked once per request batch with a reply writer and the request. The
/// handler owns the reply protocol: announce a stream of `n` values and
/// write each one, write a single value, or write nothing and let the
/// server answer `+OK`. Errors returned here tear the connection down and
/// are reported to the log.
pub trait Handler: Send + Sync + 'static {
    fn serve_redis(
        &self,
        w: &mut ReplyWriter<'_>,
        req: &mut Request,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Server configuration.
pub struct ServerConfig {
    /// Address to listen on; `":6379"` if empty. May carry a `tcp://` or
    /// `unix://` scheme prefix.
    pub addr: String,
    /// Materialise each command's arguments at read time so handlers can
    /// replay them.
    pub enable_retry: bool,
    /// After a request completes cleanly, ask its commands for follow-up
    /// commands and dispatch them.
    pub enable_pipeline: bool,
    /// Maximum duration for reading an entire request, including its
    /// streamed argument list. `None` means no limit.
    pub read_timeout: Option<Duration>,
    /// Maximum duration for flushing a response. `None` means no limit.
    pub write_timeout: Option<Duration>,
    /// Maximum time to wait for the next request; falls back to
    /// `read_timeout` when unset.
    pub idle_timeout: Option<Duration>,
    /// Observer for connection lifecycle transitions.
    pub conn_state: Option<ConnStateCallback>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            addr: String::new(),
            enable_retry: false,
            enable_pipeline: false,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            conn_state: None,
        }
    }
}

/// The timeouts and flags a connection task works with.
#[derive(Clone, Copy)]
struct ServeConfig {
    idle_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    retryable: bool,
    pipeline: bool,
}

fn resolve_serve_config(config: &ServerConfig) -> ServeConfig {
    ServeConfig {
        idle_timeout: config.idle_timeout.or(config.read_timeout),
        read_timeout: config.read_timeout,
        write_timeout: config.write_timeout,
        retryable: config.enable_retry,
        pipeline: config.enable_pipeline,
    }
}

/// State shared between the server handle, its listeners, and every live
/// connection: the actor bookkeeping consulted by shutdown, the set-once
/// shutdown signal, and the connection-state observer.
pub(crate) struct Shared {
    state: StdMutex<Tracked>,
    shutdown: watch::Sender<bool>,
    conn_state: Option<ConnStateCallback>,
    next_conn_id: AtomicU64,
}

#[derive(Default)]
struct Tracked {
    listeners: usize,
    connections: HashMap<u64, Arc<Connection>>,
}

impl Shared {
    fn new(conn_state: Option<ConnStateCallback>) -> Arc<Shared> {
        Arc::new(Shared {
            state: StdMutex::new(Tracked::default()),
            shutdown: watch::channel(false).0,
            conn_state,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn fire_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn track_listener(&self) {
        self.state.lock().unwrap().listeners += 1;
    }

    fn untrack_listener(&self) {
        self.state.lock().unwrap().listeners -= 1;
    }

    fn track_connection(&self, conn: Arc<Connection>) {
        self.state.lock().unwrap().connections.insert(conn.id(), conn);
    }

    fn untrack_connection(&self, id: u64) {
        self.state.lock().unwrap().connections.remove(&id);
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().unwrap().connections.values().cloned().collect()
    }

    /// Live listeners plus live connections: what shutdown waits on.
    fn actors(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.listeners + state.connections.len()
    }

    pub(crate) fn on_conn_state(&self, conn: &Connection, state: ConnState) {
        if let Some(callback) = &self.conn_state {
            callback(conn, state);
        }
    }

    fn next_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A bound listener the server can accept from.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            #[cfg(unix)]
            Listener::Unix(l) => l
                .local_addr()
                .map(|a| format!("{a:?}"))
                .unwrap_or_else(|_| "unknown".into()),
        }
    }

    async fn accept(&self) -> std::io::Result<(Box<dyn NetStream>, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), format!("{peer:?}")))
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Listener {
        Listener::Tcp(l)
    }
}

#[cfg(unix)]
impl From<UnixListener> for Listener {
    fn from(l: UnixListener) -> Listener {
        Listener::Unix(l)
    }
}

/// Splits an optional `scheme://` prefix off a listen address.
fn split_network_address(addr: &str) -> (&str, &str) {
    match addr.split_once("://") {
        Some((network, address)) => (network, address),
        None => ("", addr),
    }
}

/// A bare `":port"` listens on all interfaces.
fn normalize_tcp_addr(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// A Redis-protocol server: accepts connections and dispatches command
/// batches to its [`Handler`].
///
/// The handle is cheap to clone; clones share listeners, connections, and
/// the shutdown signal, so one task can run `serve` while another calls
/// `shutdown`.
pub struct Server<H> {
    handler: Arc<H>,
    addr: String,
    config: ServeConfig,
    shared: Arc<Shared>,
}

impl<H> Clone for Server<H> {
    fn clone(&self) -> Server<H> {
        Server {
            handler: Arc::clone(&self.handler),
            addr: self.addr.clone(),
            config: self.config,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: Handler> Server<H> {
    pub fn new(mut config: ServerConfig, handler: H) -> Server<H> {
        let serve_config = resolve_serve_config(&config);
        Server {
            handler: Arc::new(handler),
            addr: std::mem::take(&mut config.addr),
            config: serve_config,
            shared: Shared::new(config.conn_state.take()),
        }
    }

    /// Binds the configured address and serves it. Always returns a non-Ok
    /// result; after `close` or `shutdown` that is `Error::ServerClosed`.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let addr = if self.addr.is_empty() { ":6379" } else { &self.addr };
        let (network, address) = split_network_address(addr);
        let network = if network.is_empty() { "tcp" } else { network };

        let listener = match network {
            "tcp" => Listener::Tcp(TcpListener::bind(normalize_tcp_addr(address)).await?),
            #[cfg(unix)]
            "unix" => Listener::Unix(UnixListener::bind(address)?),
            other => {
                return Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsupported listen network {other:?}"),
                )))
            }
        };
        self.serve(listener).await
    }

    /// Accepts connections from `listener`, spawning one task per
    /// connection. Timeout-flavoured accept errors are retried immediately,
    /// temporary ones after a quadratic backoff; anything else is returned.
    pub async fn serve(&self, listener: impl Into<Listener>) -> Result<()> {
        let listener = listener.into();
        self.shared.track_listener();
        let result = self.accept_loop(&listener).await;
        self.shared.untrack_listener();
        result
    }

    async fn accept_loop(&self, listener: &Listener) -> Result<()> {
        const MIN_BACKOFF: Duration = Duration::from_millis(10);
        const MAX_BACKOFF: Duration = Duration::from_millis(1000);

        let local_addr = listener.local_addr();
        let mut shutdown = self.shared.subscribe();
        let mut attempt: u32 = 0;

        debug!(addr = %local_addr, "listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait_for(|fired| *fired) => return Err(Error::ServerClosed),
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, remote)) => {
                    attempt = 0;
                    self.spawn_connection(stream, remote, local_addr.clone());
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) if is_temporary(&e) => {
                    attempt += 1;
                    debug!(error = %e, attempt, "temporary accept error, backing off");
                    tokio::select! {
                        _ = shutdown.wait_for(|fired| *fired) => return Err(Error::ServerClosed),
                        _ = tokio::time::sleep(backoff(attempt, MIN_BACKOFF, MAX_BACKOFF)) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn spawn_connection(&self, stream: Box<dyn NetStream>, remote: String, local: String) {
        let conn = Connection::new(
            stream,
            remote,
            local,
            self.shared.next_id(),
            Arc::downgrade(&self.shared),
        );
        self.shared.track_connection(Arc::clone(&conn));
        conn.set_state(ConnState::New);
        conn.set_write_timeout(self.config.write_timeout);

        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        let config = self.config;
        tokio::spawn(serve_connection(shared, handler, conn, config));
    }

    /// Fires the shutdown signal and closes every listener and live
    /// connection immediately. For a graceful stop, use [`Server::shutdown`].
    pub fn close(&self) -> Result<()> {
        self.shared.fire_shutdown();
        for conn in self.shared.connections() {
            conn.close();
        }
        Ok(())
    }

    /// Gracefully shuts down: stops the listeners, then waits for live
    /// connections to finish, polling with a capped quadratic backoff.
    ///
    /// Returns `Error::ShutdownTimeout` iff `ctx` completes while actors
    /// are still outstanding.
    pub async fn shutdown(&self, ctx: impl Future<Output = ()>) -> Result<()> {
        const MIN_POLL: Duration = Duration::from_millis(10);
        const MAX_POLL: Duration = Duration::from_millis(500);

        self.shared.fire_shutdown();

        tokio::pin!(ctx);
        let mut attempt: u32 = 0;
        while self.shared.actors() != 0 {
            tokio::select! {
                _ = &mut ctx => return Err(Error::ShutdownTimeout),
                _ = tokio::time::sleep(backoff(attempt, MIN_POLL, MAX_POLL)) => {}
            }
            attempt += 1;
        }
        Ok(())
    }
}

/// Listens on `addr` and serves `handler`. Convenience entry point.
pub async fn listen_and_serve<H: Handler>(addr: impl Into<String>, handler: H) -> Result<()> {
    let config = ServerConfig {
        addr: addr.into(),
        ..ServerConfig::default()
    };
    Server::new(config, handler).listen_and_serve().await
}

/// Closes the connection and releases its bookkeeping on every exit path,
/// including handler panics.
struct ConnGuard {
    shared: Arc<Shared>,
    conn: Arc<Connection>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.conn.close();
        self.shared.untrack_connection(self.conn.id());
        metrics::on_connection_closed();
        debug!(remote = self.conn.remote_addr(), "connection closed");
    }
}

async fn serve_connection<H: Handler>(
    shared: Arc<Shared>,
    handler: Arc<H>,
    conn: Arc<Connection>,
    config: ServeConfig,
) {
    metrics::on_connection_accepted();
    let _guard = ConnGuard {
        shared: Arc::clone(&shared),
        conn: Arc::clone(&conn),
    };
    let mut shutdown = shared.subscribe();
    debug!(remote = conn.remote_addr(), "connection open");

    loop {
        if shared.is_shutdown() {
            return;
        }

        let ready = tokio::select! {
            _ = shutdown.wait_for(|fired| *fired) => return,
            res = conn.wait_ready_read(config.idle_timeout) => res,
        };
        if ready.is_err() {
            return;
        }

        conn.set_state(ConnState::Active);
        conn.set_read_timeout(config.read_timeout);
        let mut reader = conn.read_commands(config.retryable);

        let first = match reader.read().await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                log_error(reader.close().await.err());
                return;
            }
            Err(e) => {
                log_error(Some(e));
                return;
            }
        };

        let cmds = if first.is("MULTI") {
            // transactions are loaded into memory because the server has to
            // interleave acknowledgements between the commands it receives
            match read_transaction(&conn, &mut reader, first).await {
                Ok(Some(cmds)) => cmds,
                Ok(None) => continue, // discarded, never reaches the handler
                Err(e) => {
                    log_error(Some(e));
                    return;
                }
            }
        } else {
            vec![first]
        };

        if let Err(e) = serve_commands(&shared, handler.as_ref(), &conn, cmds, config).await {
            log_error(Some(e));
            return;
        }

        if let Err(e) = reader.close().await {
            log_error(Some(e));
            return;
        }
        conn.set_state(ConnState::Idle);
    }
}

/// Buffers a transaction: `MULTI` was just read, each queued command is
/// materialised and acknowledged with `+QUEUED` until the reader ends the
/// batch (`EXEC` or connection close) or a trailing `DISCARD` drops it.
async fn read_transaction(
    conn: &Arc<Connection>,
    reader: &mut CommandReader,
    mut multi: Command,
) -> Result<Option<Vec<Command>>> {
    multi.load_byte_args().await;
    multi.args.close().await?;
    conn.write_frames(&[Frame::from("OK")]).await?;

    let mut queued: Vec<Command> = Vec::new();
    loop {
        let Some(mut cmd) = reader.read().await? else {
            // EXEC (or a closed connection) commits the queued batch
            return Ok(Some(queued));
        };

        if cmd.is("DISCARD") {
            cmd.args.close().await?;
            conn.write_frames(&[Frame::from("OK")]).await?;
            // the queued commands are already in memory; drop them unserved
            return Ok(None);
        }

        cmd.load_byte_args().await;
        conn.write_frames(&[Frame::from("QUEUED")]).await?;
        queued.push(cmd);
    }
}

/// Decrements the in-flight request metrics even if the dispatch unwinds.
struct InFlight {
    names: Vec<String>,
    started: std::time::Instant,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::on_request_finished(&self.names);
    }
}

fn serve_commands<'a, H: Handler>(
    shared: &'a Arc<Shared>,
    handler: &'a H,
    conn: &'a Arc<Connection>,
    cmds: Vec<Command>,
    config: ServeConfig,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    // boxed: the pipeline pass recurses into dispatch
    Box::pin(async move {
        let names: Vec<String> = cmds.iter().map(|c| c.name.clone()).collect();
        metrics::on_request_started(&names);
        let in_flight = InFlight {
            names,
            started: std::time::Instant::now(),
        };

        let mut req = Request::new(
            conn.remote_addr().to_string(),
            cmds,
            deadline(config.read_timeout),
            shared.subscribe(),
        );
        let mut res = ResponseWriter::new(Arc::clone(conn));

        let mut err = serve_request(handler, &mut res, &mut req).await.err();
        let req_err = req.close().await.err();

        if config.pipeline && err.is_none() && req_err.is_none() {
            match serve_pipeline(shared, handler, conn, &mut req, config).await {
                Err(Error::NotPipeline) => {}
                Err(e) => err = Some(e),
                Ok(()) => {}
            }
        }

        metrics::record_request(&in_flight.names, in_flight.started.elapsed(), err.is_some());

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

/// Collects the follow-up command of every command in the batch and
/// dispatches them as a new request. The first command without a follow-up
/// aborts the pass with `Error::NotPipeline`, which the caller filters.
async fn serve_pipeline<H: Handler>(
    shared: &Arc<Shared>,
    handler: &H,
    conn: &Arc<Connection>,
    req: &mut Request,
    config: ServeConfig,
) -> Result<()> {
    let mut pipe_cmds = Vec::new();
    for cmd in &mut req.cmds {
        pipe_cmds.push(cmd.follow_up()?);
    }
    if pipe_cmds.is_empty() {
        return Ok(());
    }

    conn.set_read_timeout(config.read_timeout);
    serve_commands(shared, handler, conn, pipe_cmds, config).await
}

/// Answers the trivial commands itself, then hands the rest of the batch to
/// the handler behind the prepared-response interleaver, and flushes.
async fn serve_request<H: Handler>(
    handler: &H,
    res: &mut ResponseWriter,
    req: &mut Request,
) -> Result<()> {
    let mut prepared: Vec<(usize, Frame)> = Vec::new();
    let mut kept: Vec<Command> = Vec::new();

    for mut cmd in std::mem::take(&mut req.cmds) {
        if cmd.is("PING") {
            let value = match cmd.args.next::<Bytes>().await {
                Some(msg) => Frame::Bulk(msg),
                None => Frame::Simple("PONG".into()),
            };
            cmd.args.close().await?;
            prepared.push((kept.len(), value));
        } else {
            kept.push(cmd);
        }
    }
    req.cmds = kept;

    let mut w = if prepared.is_empty() {
        ReplyWriter::passthrough(res)
    } else {
        let total = req.cmds.len() + prepared.len();
        ReplyWriter::with_prepared(res, prepared, total)?
    };

    if !req.cmds.is_empty() {
        handler.serve_redis(&mut w, req).await?;
    }
    w.write_remaining()?;
    drop(w);

    res.flush().await
}

fn log_error(err: Option<Error>) {
    if let Some(err) = err {
        if !err.is_filtered() {
            error!(error = %err, "redis connection error");
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn is_temporary(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme_prefixes() {
        assert_eq!(split_network_address("tcp://0.0.0.0:6379"), ("tcp", "0.0.0.0:6379"));
        assert_eq!(split_network_address("unix:///tmp/redis.sock"), ("unix", "/tmp/redis.sock"));
        assert_eq!(split_network_address(":6379"), ("", ":6379"));
        assert_eq!(split_network_address("127.0.0.1:6379"), ("", "127.0.0.1:6379"));
    }

    #[test]
    fn bare_ports_listen_on_all_interfaces() {
        assert_eq!(normalize_tcp_addr(":6379"), "0.0.0.0:6379");
        assert_eq!(normalize_tcp_addr("127.0.0.1:6379"), "127.0.0.1:6379");
    }

    #[test]
    fn idle_timeout_falls_back_to_read_timeout() {
        let config = ServerConfig {
            read_timeout: Some(Duration::from_secs(3)),
            ..ServerConfig::default()
        };
        let resolved = resolve_serve_config(&config);
        assert_eq!(resolved.idle_timeout, Some(Duration::from_secs(3)));

        let config = ServerConfig {
            read_timeout: Some(Duration::from_secs(3)),
            idle_timeout: Some(Duration::from_secs(30)),
            ..ServerConfig::default()
        };
        let resolved = resolve_serve_config(&config);
        assert_eq!(resolved.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn error_classification() {
        use std::io::{Error as IoError, ErrorKind};

        assert!(is_timeout(&IoError::new(ErrorKind::TimedOut, "t")));
        assert!(is_timeout(&IoError::new(ErrorKind::WouldBlock, "w")));
        assert!(!is_timeout(&IoError::new(ErrorKind::BrokenPipe, "b")));

        assert!(is_temporary(&IoError::new(ErrorKind::ConnectionAborted, "a")));
        assert!(is_temporary(&IoError::new(ErrorKind::Interrupted, "i")));
        assert!(!is_temporary(&IoError::new(ErrorKind::PermissionDenied, "p")));
    }
}
