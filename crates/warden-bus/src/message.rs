//! Message vocabulary shared across the engine.

use crate::pipe::PipeSender;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global monitor ID counter
static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a registered monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(pub u64);

impl MonitorId {
    /// Allocate a new unique monitor ID.
    pub fn next() -> Self {
        Self(NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Monitor({})", self.0)
    }
}

/// Lifecycle state of the tunnel.
///
/// `Inactive` is both the initial state and the state the system cycles back
/// through; `Deactivated` marks a deliberate, user-driven shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Deactivated,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Activating => write!(f, "ACTIVATING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Deactivating => write!(f, "DEACTIVATING"),
            Self::Deactivated => write!(f, "DEACTIVATED"),
        }
    }
}

/// A command addressed to an operator.
///
/// Every command has a stable name and is routed to exactly one lane of the
/// operator it is sent to. `AddMonitor`/`RemoveMonitor` are control commands
/// handled by lane 0; the rest are dispatched to registered handlers.
#[derive(Clone)]
pub enum Command {
    /// Bring the tunnel up (operator-level, no retry policy).
    Start,
    /// Tear the tunnel down.
    Stop,
    /// Engage the keeper: monitor the tunnel and keep it up.
    On,
    /// Disengage the keeper.
    Off,
    /// Internal keeper command: long wait after exhausted retries.
    RetryLater,
    /// Internal keeper command: stability confirmation window.
    CheckStability,
    /// Register a broadcast monitor (lane 0).
    AddMonitor(MonitorId, PipeSender),
    /// Unregister a broadcast monitor (lane 0).
    RemoveMonitor(MonitorId),
}

impl Command {
    /// Stable wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::On => "ON",
            Self::Off => "OFF",
            Self::RetryLater => "RETRY_LATER",
            Self::CheckStability => "CHECK_STABILITY",
            Self::AddMonitor(..) => "ADD_MONITOR",
            Self::RemoveMonitor(..) => "REMOVE_MONITOR",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A value flowing through the bus.
#[derive(Debug, Clone)]
pub enum Message {
    /// A command (only seen on pipes when relayed for observation).
    Command(Command),
    /// A tunnel lifecycle transition.
    State(TunnelState),
    /// Free-form progress text.
    Log(String),
    /// A handler error or panic, delivered as a value instead of a crash.
    Failure(String),
}

impl Message {
    /// The state carried by this message, if it is a state event.
    pub fn state(&self) -> Option<TunnelState> {
        match self {
            Self::State(s) => Some(*s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_are_stable() {
        assert_eq!(Command::Start.name(), "START");
        assert_eq!(Command::Stop.name(), "STOP");
        assert_eq!(Command::On.name(), "ON");
        assert_eq!(Command::Off.name(), "OFF");
        assert_eq!(Command::RetryLater.name(), "RETRY_LATER");
        assert_eq!(Command::CheckStability.name(), "CHECK_STABILITY");
    }

    #[test]
    fn monitor_ids_are_unique() {
        let a = MonitorId::next();
        let b = MonitorId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn state_message_accessor() {
        assert_eq!(
            Message::State(TunnelState::Active).state(),
            Some(TunnelState::Active)
        );
        assert_eq!(Message::Log("x".into()).state(), None);
    }
}
