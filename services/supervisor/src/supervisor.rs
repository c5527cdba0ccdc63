//! The Supervisor: owns the Stem and exposes the command surface.
//!
//! The Supervisor keeps exactly one Stem alive. It launches the Stem by
//! re-executing a binary with the hidden `stem` subcommand, talks to it over
//! an IPC channel, and relaunches it (replaying every known node) when it
//! dies. The node table itself lives in the Stem; the Supervisor only keeps a
//! mirror refreshed by status replies and used for replay.
//!
//! # Event loop integration
//!
//! `Supervisor` implements `IoSource`. The host loop polls `read_fds()` and
//! calls `process()` when one is readable or `next_timestamp()` is due. That
//! is where Stem death is noticed and relaunches happen.
//!
//! # Signals
//!
//! Launching installs a `SignalFlare` for SIGCHLD, SIGTERM and SIGINT.
//! Termination signals are recorded and reported by
//! `termination_requested()`; the host decides when to shut down.

use std::collections::BTreeMap;
use std::os::fd::BorrowedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpid, Pid};
use nodetree_proto::{Message, NodeConfig, NodeStatus, Target};
use nodetree_reconcile::RetryBudget;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::event_loop::IoSource;
use crate::flare::SignalFlare;
use crate::ipc::{self, Channel};
use crate::registry::ProcessExit;
use crate::spawn::{exit_of, terminate_process};

/// Grace period for a Stem that is being replaced.
const FAILED_STEM_GRACE: Duration = Duration::from_millis(500);

/// Mirror of the Stem's node table, keyed by name.
pub type NodeMap = BTreeMap<String, NodeStatus>;

/// Health of the Supervisor's Stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StemHealth {
    /// A Stem is running and answering.
    Healthy,
    /// The Stem died and relaunching has failed `failures` times so far.
    Relaunching { failures: u32 },
    /// Relaunching keeps failing; the tree cannot heal itself.
    Unhealthy { failures: u32, reason: String },
}

impl StemHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, StemHealth::Healthy)
    }
}

/// Application-facing status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub health: StemHealth,
    pub nodes: NodeMap,
}

impl Status {
    pub fn get(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.get(name)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

struct StemProcess {
    pid: Pid,
    channel: Channel,
    launched_at: Instant,
}

impl StemProcess {
    fn exchange(&mut self, msg: &Message, timeout: Duration) -> Result<Message, SupervisorError> {
        self.channel.send(msg)?;
        self.channel.recv_timeout(timeout)
    }

    /// Close the channel and stop the process.
    fn stop(self, grace: Duration) -> Option<ProcessExit> {
        let StemProcess { pid, channel, .. } = self;
        drop(channel);
        terminate_process(pid, grace)
    }
}

pub struct Supervisor {
    config: Config,
    signals: SignalFlare,
    stem: Option<StemProcess>,
    nodes: NodeMap,
    health: StemHealth,
    relaunch_budget: RetryBudget,
    relaunch_delay: Duration,
    next_relaunch: Option<Instant>,
    termination_requested: bool,
    shut_down: bool,
}

impl Supervisor {
    /// Install signal handling and launch the first Stem.
    ///
    /// Fails if the Stem cannot be started at all.
    pub fn launch(config: Config) -> Result<Self, SupervisorError> {
        config.validate()?;
        let signals = SignalFlare::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT])?;

        let mut supervisor = Self {
            relaunch_budget: RetryBudget::new(config.relaunch_max_retries, config.relaunch_window),
            relaunch_delay: config.stem.revival.initial,
            config,
            signals,
            stem: None,
            nodes: NodeMap::new(),
            health: StemHealth::Healthy,
            next_relaunch: None,
            termination_requested: false,
            shut_down: false,
        };

        let stem = supervisor.start_stem()?;
        supervisor.stem = Some(stem);
        Ok(supervisor)
    }

    /// Pid of the current Stem, if one is running.
    pub fn stem_pid(&self) -> Option<Pid> {
        self.stem.as_ref().map(|s| s.pid)
    }

    pub fn health(&self) -> &StemHealth {
        &self.health
    }

    /// The mirrored node table as of the last status reply.
    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    /// True once SIGTERM or SIGINT has been received.
    pub fn termination_requested(&self) -> bool {
        self.termination_requested
    }

    /// Create and spawn a node.
    ///
    /// Returns an empty string on success, otherwise a description of why the
    /// node was rejected.
    pub fn create(&mut self, config: NodeConfig) -> String {
        if let Err(e) = config.validate() {
            return e.to_string();
        }
        if self.nodes.contains_key(&config.name) {
            return SupervisorError::DuplicateNode(config.name).to_string();
        }

        let name = config.name.clone();
        match self.request(Message::Create {
            config: config.clone(),
        }) {
            Ok(Message::Ack { ok: true, .. }) => {
                info!(node = %name, "node created");
                self.nodes.insert(name, NodeStatus::pending(config));
                String::new()
            }
            Ok(Message::Ack { ok: false, error }) => {
                error.unwrap_or_else(|| format!("stem rejected node '{}'", name))
            }
            Ok(other) => SupervisorError::UnexpectedReply {
                expected: "ack",
                actual: other.kind(),
            }
            .to_string(),
            Err(e) => e.to_string(),
        }
    }

    /// Create a node from loosely structured input, such as a parsed
    /// configuration file entry.
    pub fn create_value(&mut self, value: &serde_json::Value) -> String {
        match NodeConfig::from_value(value) {
            Ok(config) => self.create(config),
            Err(e) => e.to_string(),
        }
    }

    /// Terminate and remove a node, or every node for an empty name.
    ///
    /// The targets leave the mirror before the request is sent, so a Stem
    /// lost mid-request never gets them replayed.
    pub fn destroy(&mut self, target: impl Into<Target>) -> bool {
        let target = target.into();
        self.nodes.retain(|name, _| !target.matches(name));
        let ok = self.acknowledge(Message::Destroy {
            target: target.clone(),
        });
        if ok {
            info!(target = %target, "nodes destroyed");
        }
        ok
    }

    /// Terminate and re-create a node from its stored config, or every node
    /// for an empty name.
    pub fn restart(&mut self, target: impl Into<Target>) -> bool {
        let target = target.into();
        let ok = self.acknowledge(Message::Restart {
            target: target.clone(),
        });
        if ok {
            info!(target = %target, "nodes restarted");
        }
        ok
    }

    /// Fetch node status from the Stem and refresh the mirror.
    ///
    /// When the Stem cannot answer, the last mirrored state is returned
    /// together with the current health.
    pub fn status(&mut self, target: impl Into<Target>) -> Status {
        let target = target.into();
        match self.request(Message::StatusRequest {
            target: target.clone(),
        }) {
            Ok(Message::StatusReply { nodes }) => self.refresh_mirror(&target, nodes),
            Ok(other) => warn!(kind = other.kind(), "unexpected reply to status request"),
            Err(e) => warn!(error = %e, "status request failed"),
        }

        Status {
            health: self.health.clone(),
            nodes: self
                .nodes
                .iter()
                .filter(|(name, _)| target.matches(name))
                .map(|(name, status)| (name.clone(), status.clone()))
                .collect(),
        }
    }

    /// Destroy every node and stop the Stem.
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.stem.is_some() && !self.acknowledge(Message::Destroy { target: Target::All }) {
            warn!("stem did not confirm node teardown");
        }
        self.nodes.clear();

        if let Some(stem) = self.stem.take() {
            let pid = stem.pid;
            let exit = stem.stop(self.config.stem_shutdown_timeout);
            info!(pid = pid.as_raw(), ?exit, "stem stopped");
        }
    }

    fn refresh_mirror(&mut self, target: &Target, nodes: Vec<NodeStatus>) {
        match target {
            Target::All => {
                self.nodes = nodes
                    .into_iter()
                    .map(|status| (status.config.name.clone(), status))
                    .collect();
            }
            Target::One(name) => {
                self.nodes.remove(name);
                for status in nodes {
                    self.nodes.insert(status.config.name.clone(), status);
                }
            }
        }
    }

    fn acknowledge(&mut self, msg: Message) -> bool {
        let kind = msg.kind();
        match self.request(msg) {
            Ok(Message::Ack { ok: true, .. }) => true,
            Ok(Message::Ack { ok: false, error }) => {
                warn!(kind, error = ?error, "stem rejected request");
                false
            }
            Ok(other) => {
                warn!(kind, reply = other.kind(), "unexpected reply from stem");
                false
            }
            Err(e) => {
                warn!(kind, error = %e, "request failed");
                false
            }
        }
    }

    /// Send one request and wait for its reply.
    fn request(&mut self, msg: Message) -> Result<Message, SupervisorError> {
        if self.stem.is_none() {
            self.recover_if_due(Instant::now());
        }

        let timeout = self.config.request_timeout;
        let Some(stem) = self.stem.as_mut() else {
            return Err(SupervisorError::StemUnavailable(format!(
                "no stem running ({:?})",
                self.health
            )));
        };

        match stem.exchange(&msg, timeout) {
            Ok(reply) if reply.is_reply() => Ok(reply),
            Ok(other) => Err(SupervisorError::UnexpectedReply {
                expected: "reply",
                actual: other.kind(),
            }),
            Err(e) if e.is_transport_failure() => {
                error!(kind = msg.kind(), error = %e, "lost stem while waiting for reply");
                self.on_stem_lost(false);
                Err(SupervisorError::StemUnavailable(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_stem(&self) -> Result<StemProcess, SupervisorError> {
        let (channel, peer) = ipc::pair()?;
        let (read_fd, write_fd) = peer.raw();
        let exe = &self.config.stem_exe_path;

        let mut command = Command::new(exe);
        command
            .arg("stem")
            .arg("--read-fd")
            .arg(read_fd.to_string())
            .arg("--write-fd")
            .arg(write_fd.to_string())
            .arg("--parent-pid")
            .arg(getpid().as_raw().to_string())
            .arg("--settings")
            .arg(self.config.stem.to_arg()?)
            .stdin(Stdio::null());

        // The peer ends are close-on-exec; keep them open across the exec.
        unsafe {
            command.pre_exec(move || {
                for fd in [read_fd, write_fd] {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::LaunchFailed(format!("{}: {}", exe.display(), e)))?;
        drop(peer);

        let pid = Pid::from_raw(child.id() as i32);
        info!(pid = pid.as_raw(), exe = %exe.display(), "stem launched");
        Ok(StemProcess {
            pid,
            channel,
            launched_at: Instant::now(),
        })
    }

    /// Launch a Stem and wait for it to answer one status request.
    ///
    /// A binary that execs but never serves the channel fails here instead
    /// of counting as a running Stem.
    fn start_stem(&self) -> Result<StemProcess, SupervisorError> {
        let mut stem = self.spawn_stem()?;
        let probe = Message::StatusRequest { target: Target::All };
        match stem.exchange(&probe, self.config.request_timeout) {
            Ok(Message::StatusReply { .. }) => Ok(stem),
            Ok(other) => {
                stem.stop(FAILED_STEM_GRACE);
                Err(SupervisorError::LaunchFailed(format!(
                    "stem answered {} to status request",
                    other.kind()
                )))
            }
            Err(e) => {
                let pid = stem.pid;
                let exit = stem.stop(FAILED_STEM_GRACE);
                Err(SupervisorError::LaunchFailed(format!(
                    "stem {} did not answer ({}), exit: {:?}",
                    pid, e, exit
                )))
            }
        }
    }

    /// Forget the current Stem and schedule its replacement.
    ///
    /// `reaped` is true if its exit status was already collected. A Stem that
    /// dies before `min_uptime` counts as a failed relaunch, so a binary that
    /// keeps crashing backs off instead of being relaunched in a loop.
    fn on_stem_lost(&mut self, reaped: bool) {
        let Some(stem) = self.stem.take() else {
            return;
        };
        let uptime = stem.launched_at.elapsed();
        if reaped {
            drop(stem);
        } else {
            let pid = stem.pid;
            let exit = stem.stop(FAILED_STEM_GRACE);
            debug!(pid = pid.as_raw(), ?exit, "failed stem reaped");
        }

        if self.shut_down {
            return;
        }

        let now = Instant::now();
        if uptime >= self.config.stem.revival.min_uptime {
            self.relaunch_budget.clear();
            self.relaunch_delay = self.config.stem.revival.initial;
            self.next_relaunch = Some(now);
        } else {
            self.relaunch_failed(
                now,
                format!("stem died {}ms after launch", uptime.as_millis()),
            );
        }
    }

    fn recover_if_due(&mut self, now: Instant) {
        if self.next_relaunch.is_some_and(|at| at <= now) {
            self.recover(now);
        }
    }

    /// One relaunch attempt: start a Stem and replay every known node.
    fn recover(&mut self, now: Instant) {
        if self.shut_down || self.stem.is_some() {
            return;
        }

        let result = self.start_stem().and_then(|mut stem| match self.replay(&mut stem) {
            Ok(()) => Ok(stem),
            Err(e) => {
                stem.stop(FAILED_STEM_GRACE);
                Err(e)
            }
        });

        match result {
            Ok(stem) => {
                info!(
                    pid = stem.pid.as_raw(),
                    nodes = self.nodes.len(),
                    "stem relaunched, nodes replayed"
                );
                self.stem = Some(stem);
                self.health = StemHealth::Healthy;
                self.next_relaunch = None;
            }
            Err(e) => self.relaunch_failed(now, e.to_string()),
        }
    }

    /// Count a failed relaunch and schedule the next attempt.
    fn relaunch_failed(&mut self, now: Instant, reason: String) {
        let exhausted = self.relaunch_budget.record_failure(now);
        let failures = self.relaunch_budget.failures();
        self.next_relaunch = Some(now + self.relaunch_delay);
        error!(
            error = %reason,
            failures,
            exhausted,
            retry_in_ms = self.relaunch_delay.as_millis() as u64,
            "stem relaunch failed"
        );
        self.health = if exhausted {
            StemHealth::Unhealthy { failures, reason }
        } else {
            StemHealth::Relaunching { failures }
        };
        self.relaunch_delay = self.config.stem.revival.next_delay(self.relaunch_delay);
    }

    fn replay(&mut self, stem: &mut StemProcess) -> Result<(), SupervisorError> {
        let timeout = self.config.request_timeout;
        let configs: Vec<NodeConfig> = self.nodes.values().map(|s| s.config.clone()).collect();

        for config in configs {
            let name = config.name.clone();
            match stem.exchange(&Message::Create { config: config.clone() }, timeout)? {
                Message::Ack { ok: true, .. } => {
                    self.nodes.insert(name, NodeStatus::pending(config));
                }
                Message::Ack { ok: false, error } => {
                    warn!(node = %name, error = ?error, "stem rejected replayed node");
                }
                other => {
                    return Err(SupervisorError::UnexpectedReply {
                        expected: "ack",
                        actual: other.kind(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Check whether the Stem is among the exited children.
    fn check_stem_exit(&mut self) {
        let Some(pid) = self.stem_pid() else {
            return;
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                if let Some(exit) = exit_of(status) {
                    warn!(pid = pid.as_raw(), ?exit, "stem exited");
                    self.on_stem_lost(true);
                }
            }
            Err(Errno::ECHILD) => {
                warn!(pid = pid.as_raw(), "stem vanished");
                self.on_stem_lost(true);
            }
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "waitpid on stem failed"),
        }
    }

    fn drain_channel(&mut self) -> Result<(), SupervisorError> {
        let Some(stem) = self.stem.as_mut() else {
            return Ok(());
        };

        stem.channel.fill()?;
        while let Some(msg) = stem.channel.try_recv()? {
            warn!(kind = msg.kind(), "unsolicited message from stem");
        }
        Ok(())
    }
}

impl IoSource for Supervisor {
    fn tag(&self) -> &'static str {
        "supervisor"
    }

    fn read_fds(&self) -> Vec<BorrowedFd<'_>> {
        let mut fds = vec![self.signals.fd()];
        if let Some(stem) = &self.stem {
            fds.push(stem.channel.read_fd());
        }
        fds
    }

    fn next_timestamp(&self) -> Option<Instant> {
        let now = Instant::now();
        if self.signals.is_pending() {
            return Some(now);
        }
        match &self.stem {
            Some(stem) if stem.channel.has_buffered() => Some(now),
            Some(_) => None,
            None => self.next_relaunch,
        }
    }

    fn process(&mut self) -> Result<(), SupervisorError> {
        if self.signals.is_pending() {
            let pending = self.signals.take();
            if pending.contains(Signal::SIGTERM) || pending.contains(Signal::SIGINT) {
                info!("termination requested");
                self.termination_requested = true;
            }
            if pending.contains(Signal::SIGCHLD) {
                self.check_stem_exit();
            }
        }

        if let Err(e) = self.drain_channel() {
            if !e.is_transport_failure() {
                return Err(e);
            }
            warn!(error = %e, "stem channel closed");
            self.check_stem_exit();
            if self.stem.is_some() {
                self.on_stem_lost(false);
            }
        }

        if self.stem.is_none() {
            self.recover_if_due(Instant::now());
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
