//! Adapter over the foreign WireGuard engine.
//!
//! The pump speaks [`TunnelCrypto`]; the production implementation wraps
//! `boringtun`'s `Tunn` state machine. Every call yields one [`EngineOp`]
//! interpreted identically in both directions: network-bound bytes become a
//! UDP datagram, tunnel-bound bytes go onto the loopback queue, errors are
//! logged and survived, `Done` means nothing to do. After a decapsulation
//! that produced network bytes the engine must be re-invoked with empty
//! input until it reports `Done`.

use crate::config::EngineConfig;
use boringtun::noise::{Tunn, TunnResult};
use thiserror::Error;

/// One outcome of an engine call.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineOp<'a> {
    /// Send these bytes to the gateway as a single datagram.
    ToNetwork(&'a [u8]),
    /// Write these bytes into the tunnel device (IPv4 payload).
    ToTunnelV4(&'a [u8]),
    /// Write these bytes into the tunnel device (IPv6 payload).
    ToTunnelV6(&'a [u8]),
    /// Engine protocol error; transient, the session recovers on its own.
    Error(String),
    /// Nothing to do.
    Done,
}

/// The engine seam the pump drives.
pub trait TunnelCrypto: Send {
    /// Device-to-network direction: seal one packet.
    fn write<'a>(&mut self, packet: &[u8], out: &'a mut [u8]) -> EngineOp<'a>;

    /// Network-to-device direction: open one datagram. An empty `datagram`
    /// flushes queued network writes.
    fn read<'a>(&mut self, datagram: &[u8], out: &'a mut [u8]) -> EngineOp<'a>;

    /// Timer maintenance; must be called every ~100 ms.
    fn tick<'a>(&mut self, out: &'a mut [u8]) -> EngineOp<'a>;
}

/// Engine construction errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tunnel engine rejected configuration: {0}")]
    Init(String),
}

/// Production engine: boringtun's Noise state machine.
pub struct WgEngine {
    tunn: Tunn,
}

impl WgEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let tunn = Tunn::new(
            config.private_key.secret(),
            config.peer_public_key.key(),
            None,
            config.keepalive,
            0,
            None,
        )
        .map_err(|e| EngineError::Init(format!("{e:?}")))?;
        Ok(Self { tunn })
    }
}

fn convert(result: TunnResult<'_>) -> EngineOp<'_> {
    match result {
        TunnResult::WriteToNetwork(data) => EngineOp::ToNetwork(data),
        TunnResult::WriteToTunnelV4(data, _src) => EngineOp::ToTunnelV4(data),
        TunnResult::WriteToTunnelV6(data, _src) => EngineOp::ToTunnelV6(data),
        TunnResult::Err(e) => EngineOp::Error(format!("{e:?}")),
        TunnResult::Done => EngineOp::Done,
    }
}

impl TunnelCrypto for WgEngine {
    fn write<'a>(&mut self, packet: &[u8], out: &'a mut [u8]) -> EngineOp<'a> {
        convert(self.tunn.encapsulate(packet, out))
    }

    fn read<'a>(&mut self, datagram: &[u8], out: &'a mut [u8]) -> EngineOp<'a> {
        convert(self.tunn.decapsulate(None, datagram, out))
    }

    fn tick<'a>(&mut self, out: &'a mut [u8]) -> EngineOp<'a> {
        convert(self.tunn.update_timers(out))
    }
}
