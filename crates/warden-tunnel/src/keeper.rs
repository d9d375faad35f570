//! Tunnel keeper: keeps the tunnel eventually active despite transient
//! failures, without hot-looping against a persistent one.
//!
//! The keeper watches tunnel state through a monitor subscription and runs a
//! bounded retry budget: a drop with budget left means an immediate restart;
//! an exhausted budget means a long wait before trying again; a tunnel that
//! stays active through a confirmation window earns its full budget back.
//! Both timed waits are races between a cancel channel and a timer - the
//! first to complete wins, and any state change cancels.

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use warden_bus::{Command, Message, MonitorId, Operator, OperatorBuilder, Pipe, TunnelState};

/// Keeper tuning knobs.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Immediate-retry budget (the ceiling).
    pub retries: u8,
    /// Wait before retrying after the budget is exhausted.
    pub retry_wait: Duration,
    /// How long the tunnel must hold `Active` to be deemed stable.
    pub stability_wait: Duration,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_wait: Duration::from_secs(15),
            stability_wait: Duration::from_secs(15),
        }
    }
}

/// State owned by the keeper; the watcher thread and the wait lane touch it
/// only under the lock, never across a blocking wait.
struct KeeperCore {
    retries: u8,
    monitor: Option<MonitorId>,
    watcher: Option<JoinHandle<()>>,
    /// Cancels the currently pending wait, if any.
    cancel: Option<Sender<()>>,
    /// Staged receiver the next wait handler picks up.
    pending: Option<Receiver<()>>,
}

/// The retry/backoff supervisor wrapping the tunnel operator.
pub struct TunnelKeeper {
    op: Arc<Operator>,
    core: Arc<Mutex<KeeperCore>>,
}

impl TunnelKeeper {
    /// Build the keeper for a tunnel operator. `ON` engages monitoring and
    /// issues the first start; `OFF` disengages and resets the budget.
    pub fn new(tunnel: Arc<Operator>, config: KeeperConfig) -> Self {
        let core = Arc::new(Mutex::new(KeeperCore {
            retries: config.retries,
            monitor: None,
            watcher: None,
            cancel: None,
            pending: None,
        }));
        // Handlers need to address the keeper's own operator for the
        // internal wait commands; the slot is filled right after build.
        // Weak, or the lane threads would keep their own operator alive.
        let slot: Arc<OnceLock<Weak<Operator>>> = Arc::new(OnceLock::new());

        let on_core = core.clone();
        let on_tunnel = tunnel.clone();
        let on_slot = slot.clone();
        let on_config = config.clone();

        let off_core = core.clone();
        let off_tunnel = tunnel.clone();
        let off_config = config.clone();

        let retry_core = core.clone();
        let retry_tunnel = tunnel.clone();
        let retry_config = config.clone();

        let stable_core = core.clone();
        let stable_config = config;

        let op = OperatorBuilder::new("keeper")
            .lanes(2)
            .handle("ON", 1, move |_cmd, emit| {
                let mut core = on_core.lock().expect("keeper core poisoned");
                if core.monitor.is_some() {
                    return Ok(Message::Log("keeper already on".into()));
                }
                core.retries = on_config.retries;

                let (id, pipe) = on_tunnel.monitor();
                core.monitor = Some(id);
                core.watcher = Some(spawn_watcher(
                    pipe,
                    on_core.clone(),
                    on_slot.clone(),
                    on_tunnel.clone(),
                ));
                drop(core);

                info!("keeper engaged");
                emit.log("keeper engaged");
                drop(on_tunnel.send(Command::Start));
                Ok(Message::Log("monitoring".into()))
            })
            .handle("OFF", 1, move |_cmd, _emit| {
                let mut core = off_core.lock().expect("keeper core poisoned");
                if let Some(cancel) = core.cancel.take() {
                    let _ = cancel.send(());
                    debug!("waiting cancelled");
                }
                core.pending = None;
                let monitor = core.monitor.take();
                let watcher = core.watcher.take();
                core.retries = off_config.retries;
                drop(core);

                if let Some(id) = monitor {
                    off_tunnel.unmonitor(id);
                }
                if let Some(watcher) = watcher {
                    let _ = watcher.join();
                }
                info!("keeper disengaged");
                Ok(Message::Log("keeper off".into()))
            })
            .handle("RETRY_LATER", 2, move |_cmd, emit| {
                let staged = retry_core.lock().expect("keeper core poisoned").pending.take();
                let Some(cancel_rx) = staged else {
                    return Ok(Message::Log("waiting cancelled".into()));
                };

                emit.log("retry backoff started");
                select! {
                    recv(cancel_rx) -> _ => {
                        debug!("waiting cancelled");
                        Ok(Message::Log("waiting cancelled".into()))
                    }
                    recv(after(retry_config.retry_wait)) -> _ => {
                        {
                            let mut core = retry_core.lock().expect("keeper core poisoned");
                            core.cancel = None;
                            core.retries = retry_config.retries.saturating_sub(1);
                        }
                        info!("backoff elapsed, trying the tunnel again");
                        drop(retry_tunnel.send(Command::Start));
                        Ok(Message::Log("retry wait elapsed".into()))
                    }
                }
            })
            .handle("CHECK_STABILITY", 2, move |_cmd, emit| {
                let staged = stable_core.lock().expect("keeper core poisoned").pending.take();
                let Some(cancel_rx) = staged else {
                    return Ok(Message::Log("waiting cancelled".into()));
                };

                emit.log("stability check started");
                select! {
                    recv(cancel_rx) -> _ => {
                        debug!("waiting cancelled");
                        Ok(Message::Log("waiting cancelled".into()))
                    }
                    recv(after(stable_config.stability_wait)) -> _ => {
                        let mut core = stable_core.lock().expect("keeper core poisoned");
                        core.cancel = None;
                        core.retries = stable_config.retries;
                        info!("tunnel held steady, retry budget restored");
                        Ok(Message::Log("tunnel stable".into()))
                    }
                }
            })
            .build();

        let op = Arc::new(op);
        let _ = slot.set(Arc::downgrade(&op));
        Self { op, core }
    }

    /// Dispatch a command (`ON` / `OFF`) to the keeper.
    pub fn send(&self, cmd: Command) -> Pipe {
        self.op.send(cmd)
    }

    /// The keeper's operator, for monitor subscriptions.
    pub fn operator(&self) -> Arc<Operator> {
        self.op.clone()
    }

    /// Remaining immediate-retry budget.
    pub fn retries_remaining(&self) -> u8 {
        self.core.lock().expect("keeper core poisoned").retries
    }
}

/// The monitor watcher: reacts to every observed tunnel state.
fn spawn_watcher(
    pipe: Pipe,
    core: Arc<Mutex<KeeperCore>>,
    keeper: Arc<OnceLock<Weak<Operator>>>,
    tunnel: Arc<Operator>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("keeper-watch".to_string())
        .spawn(move || {
            while let Some(msg) = pipe.recv() {
                let Some(state) = msg.state() else { continue };
                debug!(%state, "keeper observed");

                let mut core = core.lock().expect("keeper core poisoned");
                if let Some(cancel) = core.cancel.take() {
                    let _ = cancel.send(());
                    core.pending = None;
                    debug!("waiting cancelled");
                }

                match state {
                    TunnelState::Inactive => {
                        if core.retries > 0 {
                            core.retries -= 1;
                            info!(remaining = core.retries, "tunnel dropped, retrying now");
                            drop(core);
                            drop(tunnel.send(Command::Start));
                        } else {
                            info!("retry budget exhausted, backing off");
                            let (cancel_tx, cancel_rx) = bounded(1);
                            core.cancel = Some(cancel_tx);
                            core.pending = Some(cancel_rx);
                            drop(core);
                            if let Some(op) = keeper.get().and_then(Weak::upgrade) {
                                drop(op.send(Command::RetryLater));
                            }
                        }
                    }
                    TunnelState::Active => {
                        let (cancel_tx, cancel_rx) = bounded(1);
                        core.cancel = Some(cancel_tx);
                        core.pending = Some(cancel_rx);
                        drop(core);
                        if let Some(op) = keeper.get().and_then(Weak::upgrade) {
                            drop(op.send(Command::CheckStability));
                        }
                    }
                    _ => {}
                }
            }
            debug!("keeper monitor closed");
        })
        .expect("failed to spawn keeper watcher")
}
