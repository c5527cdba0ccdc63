//! The Stem's table of nodes.
//!
//! Every entry is keyed by node name and tracks the live process (if any),
//! how the previous one exited and when the next revival is due. The
//! registry is pure bookkeeping; forking and signalling live in `spawn` and
//! `stem`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use nodetree_proto::{NodeConfig, NodeState, NodeStatus, Target};
use nodetree_reconcile::RevivalPolicy;

use crate::error::SupervisorError;

/// How a reaped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

/// What the Stem should do after a node's process was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The node was being terminated; its record is gone.
    Removed,
    /// The death was unexpected; revive after `delay`.
    Revive { delay: Duration },
}

/// Runtime record of one node.
#[derive(Debug, Clone)]
pub struct Node {
    pub config: NodeConfig,
    pub pid: Option<Pid>,
    /// Termination was requested; the next exit must not trigger a revival.
    pub killed: bool,
    pub exit_status: i32,
    pub signal_number: i32,
    pub revival_attempts: u32,
    pub revival_delay: Duration,
    pub spawn_time: Option<Instant>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub revive_at: Option<Instant>,
}

impl Node {
    fn new(config: NodeConfig, policy: &RevivalPolicy) -> Self {
        Self {
            config,
            pid: None,
            killed: false,
            exit_status: 0,
            signal_number: 0,
            revival_attempts: 0,
            revival_delay: policy.initial,
            spawn_time: None,
            spawned_at: None,
            revive_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> NodeState {
        if self.killed {
            NodeState::Terminating
        } else if self.pid.is_some() {
            NodeState::Running
        } else if self.revive_at.is_some() {
            NodeState::AwaitingRevival
        } else {
            NodeState::Pending
        }
    }

    /// Record a successful fork.
    pub fn record_spawn(&mut self, pid: Pid, now: Instant) {
        self.pid = Some(pid);
        self.spawn_time = Some(now);
        self.spawned_at = Some(Utc::now());
        self.revive_at = None;
    }

    /// Record a reaped process and decide what happens next.
    pub fn record_exit(
        &mut self,
        exit: ProcessExit,
        now: Instant,
        policy: &RevivalPolicy,
    ) -> ExitOutcome {
        self.note_exit(exit);

        if self.killed {
            return ExitOutcome::Removed;
        }

        let uptime = self
            .spawn_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.revival_delay = policy.delay_after_exit(self.revival_delay, uptime);
        self.schedule_revival(now);
        ExitOutcome::Revive {
            delay: self.revival_delay,
        }
    }

    /// Record how the last process ended without deciding what comes next.
    pub fn note_exit(&mut self, exit: ProcessExit) {
        self.pid = None;
        match exit {
            ProcessExit::Exited(code) => {
                self.exit_status = code;
                self.signal_number = 0;
            }
            ProcessExit::Signaled(signo) => {
                self.exit_status = 0;
                self.signal_number = signo;
            }
        }
    }

    /// Schedule a revival `revival_delay` from `now`.
    pub fn schedule_revival(&mut self, now: Instant) {
        self.revive_at = Some(now + self.revival_delay);
    }

    /// Account for a revival about to be attempted.
    pub fn begin_revival(&mut self, policy: &RevivalPolicy) {
        self.revival_attempts += 1;
        self.revival_delay = policy.next_delay(self.revival_delay);
        self.revive_at = None;
    }

    /// Forget revival history, as on an explicit restart.
    pub fn reset(&mut self, policy: &RevivalPolicy) {
        self.killed = false;
        self.pid = None;
        self.revival_attempts = 0;
        self.revival_delay = policy.initial;
        self.revive_at = None;
    }

    pub fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            config: self.config.clone(),
            state: self.state(),
            pid: self.pid.map(Pid::as_raw).unwrap_or(0),
            killed: self.killed,
            exit_status: self.exit_status,
            signal_number: self.signal_number,
            revival_attempts: self.revival_attempts,
            revival_delay_secs: self.revival_delay.as_secs(),
            spawned_at: self.spawned_at,
        }
    }
}

/// Name-keyed node table.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
    policy: RevivalPolicy,
}

impl NodeRegistry {
    pub fn new(policy: RevivalPolicy) -> Self {
        Self {
            nodes: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RevivalPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    /// Names in registry order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Add a node. Rejects invalid configs and duplicate names.
    pub fn insert(&mut self, config: NodeConfig) -> Result<&mut Node, SupervisorError> {
        config
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;

        if self.nodes.contains_key(&config.name) {
            return Err(SupervisorError::DuplicateNode(config.name));
        }

        let name = config.name.clone();
        let node = Node::new(config, &self.policy);
        Ok(self.nodes.entry(name).or_insert(node))
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.nodes.remove(name)
    }

    /// Names selected by `target`. A named target must exist.
    pub fn resolve(&self, target: &Target) -> Result<Vec<String>, SupervisorError> {
        match target {
            Target::All => Ok(self.names()),
            Target::One(name) if self.nodes.contains_key(name) => Ok(vec![name.clone()]),
            Target::One(name) => Err(SupervisorError::UnknownNode(name.clone())),
        }
    }

    pub fn find_by_pid(&mut self, pid: Pid) -> Option<&mut Node> {
        self.nodes.values_mut().find(|n| n.pid == Some(pid))
    }

    /// Apply a reaped exit to whichever node owned `pid`.
    ///
    /// Returns `None` for pids that belong to no node.
    pub fn record_exit(
        &mut self,
        pid: Pid,
        exit: ProcessExit,
        now: Instant,
    ) -> Option<(String, ExitOutcome)> {
        let policy = self.policy.clone();
        let node = self.find_by_pid(pid)?;
        let name = node.name().to_string();
        let outcome = node.record_exit(exit, now, &policy);
        if outcome == ExitOutcome::Removed {
            self.nodes.remove(&name);
        }
        Some((name, outcome))
    }

    /// Nodes whose revival time has come.
    pub fn due_for_revival(&self, now: Instant) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| !n.killed && n.pid.is_none())
            .filter(|n| n.revive_at.is_some_and(|at| at <= now))
            .map(|n| n.name().to_string())
            .collect()
    }

    /// Earliest scheduled revival.
    pub fn next_revival(&self) -> Option<Instant> {
        self.nodes.values().filter_map(|n| n.revive_at).min()
    }

    /// Snapshots of the nodes selected by `target`.
    ///
    /// An unknown name yields an empty list.
    pub fn snapshot(&self, target: &Target) -> Vec<NodeStatus> {
        self.nodes
            .values()
            .filter(|n| target.matches(n.name()))
            .map(Node::snapshot)
            .collect()
    }
}
