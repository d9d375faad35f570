//! Warden tunnel engine.
//!
//! Owns the lifecycle of the virtual network interface and the encrypted
//! path to the gateway:
//!
//! - [`operator`]: the START/STOP command pair over the message bus
//!   (permission flow, device bring-up, rollback on failure).
//! - [`keeper`]: the retry/backoff supervisor that keeps the tunnel
//!   eventually active.
//! - [`pump`]: the real-time loop multiplexing the device, the gateway UDP
//!   socket and an error-signal pipe, driving every packet through the
//!   foreign WireGuard engine.
//! - [`engine`]: the adapter over that engine.
//! - [`platform`]: the seam to the OS tunnel facility and permission UX.
//!
//! The WireGuard protocol itself is consumed, not implemented - see
//! [`engine::WgEngine`].

mod config;
mod engine;
mod keeper;
mod keys;
mod operator;
mod platform;
mod pump;

pub use config::{ConfigError, Endpoint, EngineConfig};
pub use engine::{EngineError, EngineOp, TunnelCrypto, WgEngine};
pub use keeper::{KeeperConfig, TunnelKeeper};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use operator::{tunnel_operator, TunnelDeps, TunnelError};
pub use platform::{
    permission_ticket, DeviceHandle, PermissionResolver, PermissionTicket, Platform, StubPlatform,
};
pub use pump::{PacketPump, PumpConfig, PumpError, PumpEvent, PumpStats, PumpStatsSnapshot};
