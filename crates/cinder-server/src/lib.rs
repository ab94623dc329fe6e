//! cinder-server: a Redis-protocol (RESP) server framework.
//!
//! The crate owns the connection lifecycle and command dispatch engine —
//! accepting connections, parsing RESP command streams, buffering
//! `MULTI`/`EXEC` transactions, splicing server-synthesised replies like
//! `PONG` into the response stream, and shutting down gracefully — and
//! hands every other command to a user-supplied [`Handler`].
//!
//! # quick start
//!
//! ```no_run
//! use cinder_server::{Handler, ReplyWriter, Request, Result, Server, ServerConfig};
//!
//! struct Ok200;
//!
//! impl Handler for Ok200 {
//!     async fn serve_redis(&self, _w: &mut ReplyWriter<'_>, req: &mut Request) -> Result<()> {
//!         for cmd in &mut req.cmds {
//!             cmd.args.close().await?;
//!         }
//!         // writing nothing makes the server answer +OK
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig {
//!         addr: ":6379".into(),
//!         ..ServerConfig::default()
//!     };
//!     Server::new(config, Ok200).listen_and_serve().await
//! }
//! ```

mod backoff;
mod command;
mod connection;
mod error;
mod metrics;
mod request;
mod response;
mod server;

pub mod args;
pub mod ring;

pub use args::{int, string, Args, FromArg, TxArgs};
pub use command::Command;
pub use connection::{CommandReader, ConnState, Connection, HijackedConn, NetStream};
pub use error::{Error, Result};
pub use request::Request;
pub use response::{ReplyWriter, ResponseWriter};
pub use ring::{Endpoint, HashRing};
pub use server::{
    listen_and_serve, ConnStateCallback, Handler, Listener, Server, ServerConfig,
};

// the wire value type handlers write
pub use cinder_protocol::Frame;
