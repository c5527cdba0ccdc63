//! The Stem: the single-threaded process that forks and watches nodes.
//!
//! The Stem serves Supervisor requests one at a time, reaps its children on
//! SIGCHLD, revives nodes that died unexpectedly, and exits as soon as its
//! own parent disappears. It never runs an async runtime, so forking from
//! its loop is safe.
//!
//! A successful fork returns twice. In the child, `Stem::run` returns
//! `StemOutcome::Node` and the caller switches to the node body; the Stem's
//! state is dropped there without touching the nodes it recorded.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};
use nodetree_proto::{Message, NodeConfig, Target};
use tracing::{debug, error, info, warn};

use crate::config::StemSettings;
use crate::error::SupervisorError;
use crate::event_loop::poll_readable;
use crate::flare::SignalFlare;
use crate::ipc::Channel;
use crate::liveness::{Liveness, ParentLivenessMonitor};
use crate::registry::{ExitOutcome, NodeRegistry, ProcessExit};
use crate::spawn::{
    exit_of, fork_node, prepare_child, terminate_processes, ForkOutcome, SupervisedNode,
    CHILD_SETUP_FAILED,
};

/// Exit code of a Stem whose parent disappeared.
pub const ORPHANED_EXIT_CODE: i32 = 1;

const MAX_LOOP_WAIT: Duration = Duration::from_secs(1);

/// How `Stem::run` ended.
#[derive(Debug)]
pub enum StemOutcome {
    /// We are a freshly forked node; run its body.
    Node(SupervisedNode),
    /// The Stem is done; exit with this code.
    Exit(i32),
}

pub struct Stem {
    channel: Channel,
    signals: SignalFlare,
    registry: NodeRegistry,
    liveness: ParentLivenessMonitor,
    settings: StemSettings,
    pid: Pid,
}

impl Stem {
    pub fn new(
        channel: Channel,
        parent_pid: Pid,
        settings: StemSettings,
    ) -> Result<Self, SupervisorError> {
        settings.validate()?;
        let signals = SignalFlare::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT])?;

        Ok(Self {
            channel,
            signals,
            registry: NodeRegistry::new(settings.revival.clone()),
            liveness: ParentLivenessMonitor::new(parent_pid, settings.parent_check_interval),
            settings,
            pid: getpid(),
        })
    }

    /// Serve until shutdown, orphaning, or a fork lands us in a child.
    pub fn run(mut self) -> Result<StemOutcome, SupervisorError> {
        info!(
            pid = self.pid.as_raw(),
            parent_pid = self.liveness.parent_pid().as_raw(),
            "stem started"
        );

        loop {
            let now = Instant::now();

            if let Liveness::Orphaned { current_parent } = self.liveness.poll(now) {
                warn!(
                    parent_pid = self.liveness.parent_pid().as_raw(),
                    current_parent = current_parent.as_raw(),
                    "supervisor is gone, stem exiting"
                );
                return Ok(StemOutcome::Exit(ORPHANED_EXIT_CODE));
            }

            if let Some(node) = self.revive_due(now)? {
                return Ok(StemOutcome::Node(node));
            }

            let wait = self.next_wait(Instant::now());
            poll_readable(&[self.channel.read_fd(), self.signals.fd()], wait)?;

            if self.signals.is_pending() {
                let pending = self.signals.take();
                if pending.contains(Signal::SIGCHLD) {
                    self.reap();
                }
                if pending.contains(Signal::SIGTERM) || pending.contains(Signal::SIGINT) {
                    info!("stem received termination signal");
                    self.shutdown();
                    return Ok(StemOutcome::Exit(0));
                }
            }

            self.channel.fill()?;
            loop {
                match self.channel.try_recv() {
                    Ok(Some(msg)) => match self.handle(msg) {
                        Ok(Some(node)) => return Ok(StemOutcome::Node(node)),
                        Ok(None) => {}
                        Err(e) if e.is_transport_failure() => {
                            info!(error = %e, "supervisor channel failed, stem exiting");
                            self.shutdown();
                            return Ok(StemOutcome::Exit(0));
                        }
                        Err(e) => {
                            self.shutdown();
                            return Err(e);
                        }
                    },
                    Ok(None) => break,
                    Err(SupervisorError::PeerGone) => {
                        info!("supervisor closed the channel, stem exiting");
                        self.shutdown();
                        return Ok(StemOutcome::Exit(0));
                    }
                    Err(e) if e.is_transport_failure() => {
                        error!(error = %e, "unreadable request from supervisor, stem exiting");
                        self.shutdown();
                        return Ok(StemOutcome::Exit(0));
                    }
                    Err(e) => {
                        self.shutdown();
                        return Err(e);
                    }
                }
            }
        }
    }

    fn next_wait(&self, now: Instant) -> Duration {
        let mut deadline = self.liveness.next_deadline();
        if let Some(revival) = self.registry.next_revival() {
            deadline = deadline.min(revival);
        }
        deadline.saturating_duration_since(now).min(MAX_LOOP_WAIT)
    }

    fn handle(&mut self, msg: Message) -> Result<Option<SupervisedNode>, SupervisorError> {
        debug!(kind = msg.kind(), "request received");
        match msg {
            Message::Create { config } => self.create(config),
            Message::Destroy { target } => {
                let reply = match self.registry.resolve(&target) {
                    Ok(names) => {
                        self.destroy_nodes(&names);
                        Message::ok()
                    }
                    Err(e) => Message::failed(e.to_string()),
                };
                self.channel.send(&reply)?;
                Ok(None)
            }
            Message::Restart { target } => self.restart(&target),
            Message::StatusRequest { target } => {
                let nodes = self.registry.snapshot(&target);
                self.channel.send(&Message::StatusReply { nodes })?;
                Ok(None)
            }
            other => {
                warn!(kind = other.kind(), "ignoring reply-type message sent to stem");
                Ok(None)
            }
        }
    }

    fn create(&mut self, config: NodeConfig) -> Result<Option<SupervisedNode>, SupervisorError> {
        let name = config.name.clone();
        if let Err(e) = self.registry.insert(config) {
            warn!(node = %name, error = %e, "create rejected");
            self.channel.send(&Message::failed(e.to_string()))?;
            return Ok(None);
        }

        if let Some(node) = self.spawn(&name)? {
            return Ok(Some(node));
        }
        self.channel.send(&Message::ok())?;
        Ok(None)
    }

    fn restart(&mut self, target: &Target) -> Result<Option<SupervisedNode>, SupervisorError> {
        let names = match self.registry.resolve(target) {
            Ok(names) => names,
            Err(e) => {
                self.channel.send(&Message::failed(e.to_string()))?;
                return Ok(None);
            }
        };

        self.terminate_nodes(&names);

        let policy = self.registry.policy().clone();
        for name in names {
            if let Some(node) = self.registry.get_mut(&name) {
                node.reset(&policy);
            }
            if let Some(child) = self.spawn(&name)? {
                return Ok(Some(child));
            }
        }

        self.channel.send(&Message::ok())?;
        Ok(None)
    }

    /// Mark nodes killed and stop their processes against one shared
    /// deadline.
    fn terminate_nodes(&mut self, names: &[String]) {
        let mut running = Vec::new();
        for name in names {
            let Some(node) = self.registry.get_mut(name) else {
                continue;
            };
            node.killed = true;
            node.revive_at = None;
            if let Some(pid) = node.pid {
                info!(node = %name, pid = pid.as_raw(), "terminating node");
                running.push((name.as_str(), pid));
            }
        }
        if running.is_empty() {
            return;
        }

        let pids: Vec<Pid> = running.iter().map(|&(_, pid)| pid).collect();
        for (pid, exit) in terminate_processes(&pids, self.settings.terminate_timeout) {
            let Some(&(name, _)) = running.iter().find(|&&(_, p)| p == pid) else {
                continue;
            };
            let Some(node) = self.registry.get_mut(name) else {
                continue;
            };
            node.pid = None;
            match exit {
                Some(exit) => {
                    node.note_exit(exit);
                    info!(node = %name, pid = pid.as_raw(), ?exit, "node terminated");
                }
                None => debug!(node = %name, pid = pid.as_raw(), "node was already reaped"),
            }
        }
    }

    /// Terminate nodes and remove their records.
    fn destroy_nodes(&mut self, names: &[String]) {
        self.terminate_nodes(names);
        for name in names {
            self.registry.remove(name);
        }
    }

    /// Fork the named node.
    ///
    /// Returns `Some` only in the child. A failed fork schedules a revival.
    fn spawn(&mut self, name: &str) -> Result<Option<SupervisedNode>, SupervisorError> {
        let Some(config) = self.registry.get(name).map(|n| n.config.clone()) else {
            return Ok(None);
        };

        match fork_node() {
            Ok(ForkOutcome::Child) => {
                if let Err(e) = prepare_child(&config) {
                    error!(node = %name, error = %e, "node setup failed");
                    std::process::exit(CHILD_SETUP_FAILED);
                }
                Ok(Some(SupervisedNode {
                    config,
                    parent_pid: self.pid,
                    parent_check_interval: self.settings.parent_check_interval,
                }))
            }
            Ok(ForkOutcome::Parent(pid)) => {
                let now = Instant::now();
                if let Some(node) = self.registry.get_mut(name) {
                    node.record_spawn(pid, now);
                    info!(
                        node = %name,
                        pid = pid.as_raw(),
                        attempts = node.revival_attempts,
                        "node spawned"
                    );
                }
                Ok(None)
            }
            Err(e) => {
                let now = Instant::now();
                if let Some(node) = self.registry.get_mut(name) {
                    node.schedule_revival(now);
                    error!(
                        node = %name,
                        error = %e,
                        retry_in_ms = node.revival_delay.as_millis() as u64,
                        "fork failed"
                    );
                }
                Ok(None)
            }
        }
    }

    fn revive_due(&mut self, now: Instant) -> Result<Option<SupervisedNode>, SupervisorError> {
        let policy = self.registry.policy().clone();
        for name in self.registry.due_for_revival(now) {
            if let Some(node) = self.registry.get_mut(&name) {
                node.begin_revival(&policy);
                info!(node = %name, attempt = node.revival_attempts, "reviving node");
            }
            if let Some(child) = self.spawn(&name)? {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Reap every exited child without blocking.
    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let (Some(pid), Some(exit)) = (status.pid(), exit_of(status)) else {
                        continue;
                    };
                    self.on_exit(pid, exit);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn on_exit(&mut self, pid: Pid, exit: ProcessExit) {
        match self.registry.record_exit(pid, exit, Instant::now()) {
            Some((name, ExitOutcome::Removed)) => {
                info!(node = %name, pid = pid.as_raw(), ?exit, "node terminated");
            }
            Some((name, ExitOutcome::Revive { delay })) => {
                warn!(
                    node = %name,
                    pid = pid.as_raw(),
                    ?exit,
                    delay_ms = delay.as_millis() as u64,
                    "node died unexpectedly, scheduling revival"
                );
            }
            None => debug!(pid = pid.as_raw(), ?exit, "reaped unknown child"),
        }
    }

    /// Terminate every node.
    fn shutdown(&mut self) {
        let names = self.registry.names();
        if !names.is_empty() {
            info!(nodes = names.len(), "terminating all nodes");
        }
        self.destroy_nodes(&names);
    }
}

/// Entry point for the hidden `stem` subcommand.
///
/// # Safety
///
/// `read_fd` and `write_fd` must be inherited pipe ends owned by nothing
/// else in this process.
pub unsafe fn run_from_fds(
    read_fd: i32,
    write_fd: i32,
    parent_pid: i32,
    settings: StemSettings,
) -> Result<StemOutcome, SupervisorError> {
    let channel = Channel::from_raw_fds(read_fd, write_fd)?;
    Stem::new(channel, Pid::from_raw(parent_pid), settings)?.run()
}
