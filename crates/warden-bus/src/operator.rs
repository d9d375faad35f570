//! Operator - a named command table spread over serial worker lanes.

use crate::message::{Command, Message, MonitorId};
use crate::pipe::{pipe, Pipe, PipeSender};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::thread;
use tracing::{debug, error, warn};

/// A command handler. Runs on its lane's thread; progress goes out through
/// the [`Emit`] handle, the returned message is the command's result.
pub type Handler = Box<dyn Fn(&Command, &Emit) -> anyhow::Result<Message> + Send>;

/// Emission handle given to a running handler.
///
/// Every message sent here is forwarded live to the invoking command's pipe
/// and to the lane-0 broadcast, so both the caller and any registered
/// monitors observe the full progress sequence.
pub struct Emit {
    reply: PipeSender,
    fanout: Sender<Fanout>,
}

impl Emit {
    /// Emit an arbitrary message.
    pub fn send(&self, msg: Message) {
        let _ = self.fanout.send(Fanout::Publish(msg.clone()));
        self.reply.send(msg);
    }

    /// Emit a tunnel state transition.
    pub fn state(&self, state: crate::message::TunnelState) {
        self.send(Message::State(state));
    }

    /// Emit a progress log line.
    pub fn log(&self, line: impl Into<String>) {
        self.send(Message::Log(line.into()));
    }
}

/// One unit of lane work: a command plus the caller's pipe.
struct Job {
    cmd: Command,
    reply: PipeSender,
}

/// Lane-0 control traffic.
enum Fanout {
    Add(MonitorId, PipeSender),
    Remove(MonitorId),
    Publish(Message),
}

/// Builds an [`Operator`] from handler registrations.
pub struct OperatorBuilder {
    name: &'static str,
    lanes: usize,
    handlers: Vec<HashMap<&'static str, Handler>>,
    routes: HashMap<&'static str, usize>,
}

impl OperatorBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lanes: 1,
            handlers: vec![HashMap::new()],
            routes: HashMap::new(),
        }
    }

    /// Set the number of worker lanes (lane indices start at 1; lane 0 is
    /// the broadcast lane and cannot carry handlers).
    pub fn lanes(mut self, n: usize) -> Self {
        assert!(n >= 1, "an operator needs at least one worker lane");
        self.lanes = n;
        self.handlers.resize_with(n, HashMap::new);
        self
    }

    /// Register a handler for a command name on a worker lane.
    pub fn handle<F>(mut self, name: &'static str, lane: usize, handler: F) -> Self
    where
        F: Fn(&Command, &Emit) -> anyhow::Result<Message> + Send + 'static,
    {
        assert!(
            lane >= 1 && lane <= self.lanes,
            "lane {lane} out of range for operator {}",
            self.name
        );
        self.routes.insert(name, lane);
        self.handlers[lane - 1].insert(name, Box::new(handler));
        self
    }

    pub fn build(self) -> Operator {
        let (fanout_tx, fanout_rx) = unbounded();
        let mut threads = Vec::with_capacity(self.lanes + 1);
        let mut lane_txs = Vec::with_capacity(self.lanes);

        let fanout_thread = thread::Builder::new()
            .name(format!("{}-fanout", self.name))
            .spawn(move || run_fanout(fanout_rx))
            .expect("failed to spawn fanout thread");
        threads.push(fanout_thread);

        for (idx, handlers) in self.handlers.into_iter().enumerate() {
            let (tx, rx) = unbounded::<Job>();
            let fanout = fanout_tx.clone();
            let name = self.name;
            let lane = idx + 1;
            let handle = thread::Builder::new()
                .name(format!("{}-lane-{}", self.name, lane))
                .spawn(move || run_lane(name, lane, rx, handlers, fanout))
                .expect("failed to spawn lane thread");
            lane_txs.push(tx);
            threads.push(handle);
        }

        Operator {
            name: self.name,
            routes: self.routes,
            lanes: lane_txs,
            fanout: Some(fanout_tx),
            threads,
        }
    }
}

/// A running operator. Dropping it drains and joins every lane.
pub struct Operator {
    name: &'static str,
    routes: HashMap<&'static str, usize>,
    lanes: Vec<Sender<Job>>,
    fanout: Option<Sender<Fanout>>,
    threads: Vec<JoinHandle<()>>,
}

impl Operator {
    /// Dispatch a command and return the pipe its progress arrives on.
    ///
    /// Never blocks on the handler: the returned pipe receives progress
    /// events, the result, and then closes. Monitor control commands are
    /// diverted to lane 0; every other command goes to its registered lane,
    /// or the first worker lane when unregistered (where the missing handler
    /// is reported as a failure value).
    pub fn send(&self, cmd: Command) -> Pipe {
        let (reply, pipe) = pipe();
        match cmd {
            Command::AddMonitor(id, sender) => {
                debug!(operator = self.name, %id, "registering monitor");
                if let Some(fanout) = &self.fanout {
                    let _ = fanout.send(Fanout::Add(id, sender));
                }
            }
            Command::RemoveMonitor(id) => {
                debug!(operator = self.name, %id, "removing monitor");
                if let Some(fanout) = &self.fanout {
                    let _ = fanout.send(Fanout::Remove(id));
                }
            }
            cmd => {
                let lane = self.routes.get(cmd.name()).copied().unwrap_or(1);
                if self.lanes[lane - 1].send(Job { cmd, reply }).is_err() {
                    // Operator shutting down; the dropped reply closes the pipe.
                }
                return pipe;
            }
        }
        // Control commands complete immediately; dropping `reply` closes the
        // pipe so callers that wait observe completion.
        drop(reply);
        pipe
    }

    /// Register a broadcast monitor and return its id plus the pipe every
    /// broadcast message is fanned out to.
    pub fn monitor(&self) -> (MonitorId, Pipe) {
        let id = MonitorId::next();
        let (tx, rx) = pipe();
        let _ = self.send(Command::AddMonitor(id, tx));
        (id, rx)
    }

    /// Unregister a previously added monitor.
    pub fn unmonitor(&self, id: MonitorId) {
        let _ = self.send(Command::RemoveMonitor(id));
    }

    /// Publish a message to every registered monitor without involving a
    /// worker lane.
    pub fn broadcast(&self, msg: Message) {
        if let Some(fanout) = &self.fanout {
            let _ = fanout.send(Fanout::Publish(msg));
        }
    }

    /// Operator name (for logs).
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for Operator {
    fn drop(&mut self) {
        debug!(operator = self.name, "shutting down");
        self.lanes.clear();
        self.fanout.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_lane(
    name: &'static str,
    lane: usize,
    rx: Receiver<Job>,
    handlers: HashMap<&'static str, Handler>,
    fanout: Sender<Fanout>,
) {
    debug!(operator = name, lane, "lane started");
    for job in rx.iter() {
        let cmd_name = job.cmd.name();
        let Some(handler) = handlers.get(cmd_name) else {
            warn!(operator = name, lane, command = cmd_name, "unknown command");
            job.reply
                .send(Message::Failure(format!("unknown command {cmd_name}")));
            continue;
        };

        let emit = Emit {
            reply: job.reply.clone(),
            fanout: fanout.clone(),
        };

        // Panic isolation boundary: a failing handler is reported on the
        // pipe, the lane keeps draining its queue.
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&job.cmd, &emit)));
        match result {
            Ok(Ok(msg)) => {
                job.reply.send(msg);
            }
            Ok(Err(e)) => {
                warn!(operator = name, lane, command = cmd_name, error = %e, "command failed");
                job.reply.send(Message::Failure(format!("{e:#}")));
            }
            Err(panic_info) => {
                let text = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(operator = name, lane, command = cmd_name, panic = %text, "handler panicked");
                job.reply.send(Message::Failure(text));
            }
        }
        // The job's reply sender drops here, closing the caller's pipe.
    }
    debug!(operator = name, lane, "lane stopped");
}

fn run_fanout(rx: Receiver<Fanout>) {
    let mut monitors: HashMap<MonitorId, PipeSender> = HashMap::new();
    for ctl in rx.iter() {
        match ctl {
            Fanout::Add(id, sender) => {
                monitors.insert(id, sender);
            }
            Fanout::Remove(id) => {
                monitors.remove(&id);
            }
            Fanout::Publish(msg) => {
                monitors.retain(|id, m| {
                    let alive = m.send(msg.clone());
                    if !alive {
                        debug!(%id, "monitor consumer gone, removing");
                    }
                    alive
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TunnelState;
    use std::time::Duration;

    fn echo_operator() -> Operator {
        OperatorBuilder::new("test")
            .lanes(2)
            .handle("START", 1, |_cmd, emit| {
                emit.state(TunnelState::Activating);
                emit.state(TunnelState::Active);
                Ok(Message::State(TunnelState::Active))
            })
            .handle("STOP", 1, |_cmd, _emit| {
                anyhow::bail!("already stopped")
            })
            .handle("ON", 2, |_cmd, _emit| {
                panic!("lane must survive this")
            })
            .build()
    }

    #[test]
    fn command_progress_and_result_arrive_on_pipe() {
        let op = echo_operator();
        let messages = op.send(Command::Start).collect();

        let states: Vec<_> = messages.iter().filter_map(|m| m.state()).collect();
        assert_eq!(
            states,
            vec![
                TunnelState::Activating,
                TunnelState::Active,
                TunnelState::Active
            ]
        );
    }

    #[test]
    fn handler_error_is_a_failure_value() {
        let op = echo_operator();
        match op.send(Command::Stop).wait() {
            Err(crate::pipe::BusError::Failure(f)) => assert!(f.contains("already stopped")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_a_failure_value() {
        let op = OperatorBuilder::new("empty").build();
        match op.send(Command::Start).wait() {
            Err(crate::pipe::BusError::Failure(f)) => assert!(f.contains("unknown command")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn lane_survives_handler_panic() {
        let op = echo_operator();

        // First command panics its handler...
        let failed = op.send(Command::On).wait();
        assert!(failed.is_err());

        // ...but the operator still serves later commands.
        let ok = op.send(Command::Start).wait();
        assert!(ok.is_ok());
    }

    #[test]
    fn monitors_observe_broadcast_traffic() {
        let op = echo_operator();
        let (_id, monitor) = op.monitor();

        // Give lane 0 a moment to register before traffic flows.
        std::thread::sleep(Duration::from_millis(20));

        op.send(Command::Start).wait().unwrap();

        let first = monitor
            .recv_timeout(Duration::from_secs(1))
            .expect("broadcast should arrive")
            .expect("monitor still open");
        assert_eq!(first.state(), Some(TunnelState::Activating));
    }

    #[test]
    fn dead_monitor_is_auto_removed() {
        let op = echo_operator();
        let (_id, monitor) = op.monitor();
        std::thread::sleep(Duration::from_millis(20));
        drop(monitor);

        // Both sends must succeed even though the first fan-out discovers
        // the dead consumer.
        op.send(Command::Start).wait().unwrap();
        op.send(Command::Start).wait().unwrap();
    }

    #[test]
    fn removed_monitor_stops_receiving() {
        let op = echo_operator();
        let (id, monitor) = op.monitor();
        std::thread::sleep(Duration::from_millis(20));

        op.unmonitor(id);
        std::thread::sleep(Duration::from_millis(20));

        op.send(Command::Start).wait().unwrap();
        match monitor.recv_timeout(Duration::from_millis(100)) {
            Ok(None) | Err(_) => {}
            Ok(Some(msg)) => panic!("unexpected delivery after removal: {msg:?}"),
        }
    }

    #[test]
    fn same_lane_commands_run_in_arrival_order() {
        use std::sync::{Arc, Mutex};

        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();

        let op = OperatorBuilder::new("ordered")
            .handle("START", 1, move |_c, _e| {
                std::thread::sleep(Duration::from_millis(30));
                a.lock().unwrap().push(1);
                Ok(Message::Log("first".into()))
            })
            .handle("STOP", 1, move |_c, _e| {
                b.lock().unwrap().push(2);
                Ok(Message::Log("second".into()))
            })
            .build();

        let p1 = op.send(Command::Start);
        let p2 = op.send(Command::Stop);
        p1.wait().unwrap();
        p2.wait().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
