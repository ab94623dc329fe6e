//! Commands.
//!
//! A [`Command`] is an opcode plus its lazy argument list. The engine only
//! ever interprets `MULTI`, `DISCARD`, `PING`, and the `EXEC` terminator;
//! every other opcode is an opaque string forwarded to the handler.

use bytes::Bytes;

use crate::args::{Args, FromArg};
use crate::error::{Error, Result};

/// One command of a request batch.
pub struct Command {
    /// The opcode, as sent by the client.
    pub name: String,
    /// The arguments following the opcode. Consumed exactly once.
    pub args: Args,
    follow_up: Option<Box<Command>>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Args) -> Command {
        Command {
            name: name.into(),
            args,
            follow_up: None,
        }
    }

    /// ASCII-case-insensitive opcode test.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Attaches a follow-up command for the pipeline pass.
    pub fn with_follow_up(mut self, cmd: Command) -> Command {
        self.set_follow_up(cmd);
        self
    }

    /// Attaches a follow-up command for the pipeline pass.
    pub fn set_follow_up(&mut self, cmd: Command) {
        self.follow_up = Some(Box::new(cmd));
    }

    /// Takes the follow-up command this command produces, if any.
    ///
    /// `Error::NotPipeline` means "no follow-up"; the pipeline pass filters
    /// it and it never reaches the error log.
    pub fn follow_up(&mut self) -> Result<Command> {
        self.follow_up.take().map(|b| *b).ok_or(Error::NotPipeline)
    }

    /// Forces the argument list into memory so the connection can keep
    /// reading past this command (transactions, retryable reads).
    ///
    /// Errors encountered while materialising are kept in the argument list
    /// and reported by its `close`.
    pub async fn load_byte_args(&mut self) {
        let mut args = std::mem::take(&mut self.args);
        let mut items: Vec<Bytes> = Vec::with_capacity(args.len());
        while let Some(data) = args.next::<Bytes>().await {
            items.push(data);
        }
        self.args = match args.close().await {
            Ok(()) => Args::bytes(items),
            Err(e) => Args::error(e),
        };
    }

    /// Materialises the arguments of a frame-decoded value, used when a
    /// command is rebuilt from parsed frames.
    pub fn from_frames(name: impl Into<String>, frames: Vec<cinder_protocol::Frame>) -> Command {
        let items: Result<Vec<Bytes>> = frames.into_iter().map(Bytes::from_frame).collect();
        match items {
            Ok(items) => Command::new(name, Args::bytes(items)),
            Err(e) => Command::new(name, Args::error(e)),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_protocol::Frame;

    #[tokio::test]
    async fn opcode_matching_ignores_case() {
        let cmd = Command::new("multi", Args::default());
        assert!(cmd.is("MULTI"));
        assert!(cmd.is("Multi"));
        assert!(!cmd.is("EXEC"));
    }

    #[tokio::test]
    async fn load_byte_args_materialises() {
        let mut cmd = Command::new(
            "SET",
            Args::list([Frame::Bulk(Bytes::from_static(b"k")), Frame::Integer(7)]),
        );
        cmd.load_byte_args().await;

        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.args.next::<String>().await.unwrap(), "k");
        assert_eq!(cmd.args.next::<i64>().await.unwrap(), 7);
        cmd.args.close().await.unwrap();
    }

    #[tokio::test]
    async fn load_byte_args_keeps_errors() {
        let mut cmd = Command::new(
            "SET",
            Args::list([Frame::Error("ERR poisoned".into())]),
        );
        cmd.load_byte_args().await;

        assert_eq!(cmd.args.len(), 0);
        let err = cmd.args.close().await.unwrap_err();
        assert!(matches!(err, Error::Reply(_)), "got {err:?}");
    }

    #[test]
    fn follow_up_defaults_to_not_pipeline() {
        let mut cmd = Command::new("GET", Args::default());
        assert!(matches!(cmd.follow_up().unwrap_err(), Error::NotPipeline));
    }

    #[test]
    fn follow_up_is_taken_once() {
        let mut cmd = Command::new("GET", Args::default())
            .with_follow_up(Command::new("PING", Args::default()));

        let follow = cmd.follow_up().unwrap();
        assert_eq!(follow.name, "PING");
        assert!(matches!(cmd.follow_up().unwrap_err(), Error::NotPipeline));
    }
}
