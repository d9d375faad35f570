//! Pipe - the ordered, closable channel a command's progress flows through.

use crate::message::Message;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced when draining a pipe.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The executor reported a failure value on the pipe.
    #[error("command failed: {0}")]
    Failure(String),

    /// The pipe closed without delivering a result.
    #[error("pipe closed without a result")]
    Closed,
}

/// Write side of a pipe. Owned by the executor; dropping every clone closes
/// the pipe and the reader observes end-of-stream.
#[derive(Clone)]
pub struct PipeSender {
    tx: Sender<Message>,
}

impl PipeSender {
    /// Deliver a message. Returns false if the consumer is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

impl std::fmt::Debug for PipeSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PipeSender")
    }
}

/// Read side of a pipe.
pub struct Pipe {
    rx: Receiver<Message>,
}

/// Create a fresh pipe.
pub fn pipe() -> (PipeSender, Pipe) {
    let (tx, rx) = unbounded();
    (PipeSender { tx }, Pipe { rx })
}

impl Pipe {
    /// Block for the next message; `None` means the pipe closed.
    pub fn recv(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    /// Block with a timeout. `Ok(None)` means the pipe closed; `Err` means
    /// the timeout elapsed with the pipe still open.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, RecvTimeoutError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(e @ RecvTimeoutError::Timeout) => Err(e),
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// The underlying receiver, for use in `select!` races.
    pub fn receiver(&self) -> &Receiver<Message> {
        &self.rx
    }

    /// Drain the pipe to completion and return the final message.
    ///
    /// A trailing [`Message::Failure`] becomes `Err(BusError::Failure)`;
    /// a pipe that closes without any message becomes `Err(BusError::Closed)`.
    pub fn wait(self) -> Result<Message, BusError> {
        let mut last = None;
        while let Ok(msg) = self.rx.recv() {
            last = Some(msg);
        }
        match last {
            Some(Message::Failure(f)) => Err(BusError::Failure(f)),
            Some(msg) => Ok(msg),
            None => Err(BusError::Closed),
        }
    }

    /// Drain the pipe to completion, collecting every message in order.
    pub fn collect(self) -> Vec<Message> {
        self.rx.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TunnelState;

    #[test]
    fn messages_arrive_in_order() {
        let (tx, rx) = pipe();
        tx.send(Message::State(TunnelState::Activating));
        tx.send(Message::State(TunnelState::Active));
        drop(tx);

        let states: Vec<_> = rx.collect().iter().filter_map(|m| m.state()).collect();
        assert_eq!(states, vec![TunnelState::Activating, TunnelState::Active]);
    }

    #[test]
    fn wait_returns_final_message() {
        let (tx, rx) = pipe();
        tx.send(Message::State(TunnelState::Activating));
        tx.send(Message::State(TunnelState::Active));
        drop(tx);

        let result = rx.wait().unwrap();
        assert_eq!(result.state(), Some(TunnelState::Active));
    }

    #[test]
    fn wait_surfaces_trailing_failure() {
        let (tx, rx) = pipe();
        tx.send(Message::State(TunnelState::Activating));
        tx.send(Message::Failure("permission denied".into()));
        drop(tx);

        match rx.wait() {
            Err(BusError::Failure(f)) => assert!(f.contains("permission denied")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_close_is_an_error() {
        let (tx, rx) = pipe();
        drop(tx);
        assert!(matches!(rx.wait(), Err(BusError::Closed)));
    }

    #[test]
    fn send_after_reader_gone_reports_false() {
        let (tx, rx) = pipe();
        drop(rx);
        assert!(!tx.send(Message::Log("lost".into())));
    }
}
