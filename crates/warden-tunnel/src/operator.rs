//! Tunnel operator: the START/STOP command pair over the message bus.
//!
//! Owns the raw start sequence - permission check, ask-permission flow,
//! device bring-up, pump spawn - and emits every lifecycle transition on the
//! invoking command's pipe so a supervisor can observe the full sequence,
//! not just the final state.

use crate::config::EngineConfig;
use crate::engine::WgEngine;
use crate::platform::Platform;
use crate::pump::{PacketPump, PumpConfig, PumpEvent};
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use warden_bus::{Message, Operator, OperatorBuilder, TunnelState};
use warden_filters::{BlockSetHandle, DnsGate};

/// How long the ask-permission flow may take before counting as denied.
const PERMISSION_WAIT: Duration = Duration::from_secs(60);

/// Tunnel command failures, delivered as values on the command pipe.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel already started")]
    AlreadyStarted,

    #[error("tunnel already stopped")]
    AlreadyStopped,

    #[error("tunnel permission denied")]
    PermissionDenied,

    #[error("tunnel start failed: {0}")]
    StartFailed(#[source] anyhow::Error),
}

/// Everything the tunnel operator needs, constructor-injected.
pub struct TunnelDeps {
    pub platform: Arc<dyn Platform>,
    pub config: EngineConfig,
    /// Block-set snapshots for the pump's DNS gate.
    pub blocked: Arc<BlockSetHandle>,
    pub pump: PumpConfig,
    /// Out-of-band pump notifications (power saving, stopped).
    pub events: Sender<PumpEvent>,
}

/// State owned by the operator's command lane.
#[derive(Default)]
struct Core {
    started: bool,
    pump: Option<PacketPump>,
}

/// Build the tunnel operator: `START` and `STOP` on one serial lane.
pub fn tunnel_operator(deps: TunnelDeps) -> Operator {
    let deps = Arc::new(deps);
    let core = Arc::new(Mutex::new(Core::default()));

    let start_deps = deps.clone();
    let start_core = core.clone();
    let stop_deps = deps;
    let stop_core = core;

    OperatorBuilder::new("tunnel")
        .handle("START", 1, move |_cmd, emit| {
            let mut core = start_core.lock().expect("tunnel core poisoned");
            if core.started {
                return Err(TunnelError::AlreadyStarted.into());
            }

            emit.state(TunnelState::Activating);

            if !start_deps.platform.has_permission() {
                emit.log("requesting tunnel permission");
                let ticket = start_deps.platform.request_permission();
                let granted = ticket.wait(PERMISSION_WAIT);
                if !granted && !start_deps.platform.has_permission() {
                    warn!("tunnel permission denied by user");
                    emit.state(TunnelState::Inactive);
                    return Err(TunnelError::PermissionDenied.into());
                }
            }

            match bring_up(&start_deps) {
                Ok(pump) => {
                    core.pump = Some(pump);
                    core.started = true;
                    info!(gateway = %start_deps.config.gateway_id, "tunnel up");
                    emit.state(TunnelState::Active);
                    Ok(Message::Log("tunnel started".into()))
                }
                Err(e) => {
                    warn!(error = %e, "native start failed, rolling back");
                    emit.state(TunnelState::Deactivating);
                    start_deps.platform.shutdown_device();
                    emit.state(TunnelState::Inactive);
                    Err(TunnelError::StartFailed(e).into())
                }
            }
        })
        .handle("STOP", 1, move |_cmd, emit| {
            let mut core = stop_core.lock().expect("tunnel core poisoned");
            if !core.started {
                return Err(TunnelError::AlreadyStopped.into());
            }

            emit.state(TunnelState::Deactivating);
            if let Some(pump) = core.pump.take() {
                pump.stop();
                // Dropping joins the pump thread.
                drop(pump);
            }
            stop_deps.platform.shutdown_device();
            core.started = false;
            info!("tunnel down");
            emit.state(TunnelState::Inactive);
            Ok(Message::Log("tunnel stopped".into()))
        })
        .build()
}

/// Open the device, build the engine and spawn the pump.
fn bring_up(deps: &TunnelDeps) -> anyhow::Result<PacketPump> {
    let device = deps.platform.open_device(&deps.config)?;
    let engine = WgEngine::new(&deps.config)?;
    let gate = DnsGate::new(deps.blocked.clone());

    let mut pump_config = deps.pump.clone();
    pump_config.power_saving = deps.config.power_saving;

    let pump = PacketPump::spawn(
        engine,
        device,
        deps.config.endpoint.to_socket_addr(),
        gate,
        pump_config,
        deps.events.clone(),
    )?;
    Ok(pump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::keys::PrivateKey;
    use crate::platform::StubPlatform;
    use crossbeam_channel::unbounded;
    use warden_bus::{BusError, Command};

    fn config() -> EngineConfig {
        EngineConfig::new(
            "test-gw",
            Endpoint::ipv4(127, 0, 0, 1, 51820),
            PrivateKey::generate(),
            PrivateKey::generate().public_key(),
        )
    }

    fn operator_with(platform: Arc<StubPlatform>) -> Operator {
        let (events, _) = unbounded();
        tunnel_operator(TunnelDeps {
            platform,
            config: config(),
            blocked: Arc::new(BlockSetHandle::new()),
            pump: PumpConfig::default(),
            events,
        })
    }

    fn states_of(messages: &[Message]) -> Vec<TunnelState> {
        messages.iter().filter_map(|m| m.state()).collect()
    }

    #[test]
    fn successful_start_emits_activating_then_active() {
        let op = operator_with(Arc::new(StubPlatform::new(true)));

        let messages = op.send(Command::Start).collect();
        assert_eq!(
            states_of(&messages),
            vec![TunnelState::Activating, TunnelState::Active]
        );

        op.send(Command::Stop).wait().unwrap();
    }

    #[test]
    fn start_twice_fails_with_already_started() {
        let op = operator_with(Arc::new(StubPlatform::new(true)));

        op.send(Command::Start).wait().unwrap();
        match op.send(Command::Start).wait() {
            Err(BusError::Failure(f)) => assert!(f.contains("already started")),
            other => panic!("expected failure, got {other:?}"),
        }

        op.send(Command::Stop).wait().unwrap();
    }

    #[test]
    fn stop_before_start_fails_with_already_stopped() {
        let op = operator_with(Arc::new(StubPlatform::new(true)));

        match op.send(Command::Stop).wait() {
            Err(BusError::Failure(f)) => assert!(f.contains("already stopped")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn failed_start_emits_full_rollback_sequence() {
        let op = operator_with(Arc::new(StubPlatform::failing()));

        let messages = op.send(Command::Start).collect();
        assert_eq!(
            states_of(&messages),
            vec![
                TunnelState::Activating,
                TunnelState::Deactivating,
                TunnelState::Inactive
            ]
        );
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::Failure(f) if f.contains("start failed"))));
    }

    #[test]
    fn denied_permission_emits_inactive() {
        let op = operator_with(Arc::new(StubPlatform::denying()));

        let messages = op.send(Command::Start).collect();
        assert_eq!(
            states_of(&messages),
            vec![TunnelState::Activating, TunnelState::Inactive]
        );
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::Failure(f) if f.contains("permission denied"))));
    }

    #[test]
    fn permission_granted_on_ask_proceeds() {
        // Not granted up front, but the ask flow grants it.
        let op = operator_with(Arc::new(StubPlatform::new(false)));

        let messages = op.send(Command::Start).collect();
        assert_eq!(
            states_of(&messages),
            vec![TunnelState::Activating, TunnelState::Active]
        );

        op.send(Command::Stop).wait().unwrap();
    }

    #[test]
    fn stop_then_start_cycles_cleanly() {
        let op = operator_with(Arc::new(StubPlatform::new(true)));

        op.send(Command::Start).wait().unwrap();
        op.send(Command::Stop).wait().unwrap();

        let messages = op.send(Command::Start).collect();
        assert_eq!(
            states_of(&messages),
            vec![TunnelState::Activating, TunnelState::Active]
        );
        op.send(Command::Stop).wait().unwrap();
    }
}
