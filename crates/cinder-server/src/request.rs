//! Requests.

use tokio::sync::watch;
use tokio::time::Instant;

use crate::command::Command;
use crate::error::{Error, Result};

/// One request batch handed to the handler: normally a single command, or
/// the queued body of a committed transaction.
pub struct Request {
    addr: String,
    /// The commands of this batch, in arrival order.
    pub cmds: Vec<Command>,
    deadline: Option<Instant>,
    shutdown: watch::Receiver<bool>,
}

impl Request {
    pub(crate) fn new(
        addr: String,
        cmds: Vec<Command>,
        deadline: Option<Instant>,
        shutdown: watch::Receiver<bool>,
    ) -> Request {
        Request {
            addr,
            cmds,
            deadline,
            shutdown,
        }
    }

    /// The peer address the request arrived from.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The absolute deadline of this request, if the server has a read
    /// timeout configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the request should be abandoned: at its deadline or on
    /// server shutdown, whichever comes first. Handlers doing slow work are
    /// expected to race themselves against this.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = async {
                match self.deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
            _ = shutdown.wait_for(|fired| *fired) => {}
        }
    }

    /// Drains whatever is left of every command's arguments, returning the
    /// first error seen.
    pub(crate) async fn close(&mut self) -> Result<()> {
        let mut first: Option<Error> = None;
        for cmd in &mut self.cmds {
            if let Err(e) = cmd.args.close().await {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::args::Args;
    use cinder_protocol::Frame;

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn cancelled_resolves_at_the_deadline() {
        let (_tx, rx) = shutdown_pair();
        let req = Request::new(
            "client:0".into(),
            Vec::new(),
            Some(Instant::now() + Duration::from_millis(20)),
            rx,
        );
        tokio::time::timeout(Duration::from_secs(1), req.cancelled())
            .await
            .expect("deadline should cancel the request");
    }

    #[tokio::test]
    async fn cancelled_resolves_on_shutdown() {
        let (tx, rx) = shutdown_pair();
        let req = Request::new("client:0".into(), Vec::new(), None, rx);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), req.cancelled())
            .await
            .expect("shutdown should cancel the request");
    }

    #[tokio::test]
    async fn close_drains_all_commands() {
        let (_tx, rx) = shutdown_pair();
        let cmds = vec![
            Command::new("SET", Args::list([Frame::Integer(1)])),
            Command::new("SET", Args::list([Frame::Error("ERR a".into())])),
            Command::new("SET", Args::list([Frame::Error("ERR b".into())])),
        ];
        let mut req = Request::new("client:0".into(), cmds, None, rx);

        let err = req.close().await.unwrap_err();
        assert!(matches!(err, Error::Reply(ref m) if m == "ERR a"));
    }
}
