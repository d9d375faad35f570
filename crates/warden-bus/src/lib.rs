//! Warden message bus - the actor substrate everything else runs on.
//!
//! An [`Operator`] is a named table of command handlers spread over a small
//! set of worker lanes. Each lane is a serial execution queue backed by its
//! own thread, so two commands on the same lane never run concurrently and
//! shared state touched only from one lane needs no extra locking. Lane 0 is
//! reserved for monitor registration and broadcast fan-out.
//!
//! Sending a command returns a [`Pipe`]: an ordered, closable channel that
//! carries the handler's progress events, its result, and then end-of-stream.
//! Handler panics and errors are converted into [`Message::Failure`] values
//! on the pipe - a failing task never takes its lane down.

mod message;
mod operator;
mod pipe;

pub use message::{Command, Message, MonitorId, TunnelState};
pub use operator::{Emit, Operator, OperatorBuilder};
pub use pipe::{pipe, BusError, Pipe, PipeSender};
