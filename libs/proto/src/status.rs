//! Node status snapshots reported by the Stem.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;

/// Observable lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Created but no process has been spawned yet.
    Pending,
    /// A process is live (or a zombie awaiting reap).
    Running,
    /// The process died unexpectedly and a revival is scheduled.
    AwaitingRevival,
    /// Termination was requested and the record is about to be removed.
    Terminating,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::AwaitingRevival => "awaiting_revival",
            NodeState::Terminating => "terminating",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time snapshot of a node's runtime record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// The node's configuration.
    pub config: NodeConfig,

    /// Derived lifecycle state.
    pub state: NodeState,

    /// Process ID, or 0 when no process is running.
    pub pid: i32,

    /// Whether termination was voluntarily requested.
    pub killed: bool,

    /// Exit code of the last process, if it exited normally.
    pub exit_status: i32,

    /// Signal that terminated the last process, if any.
    pub signal_number: i32,

    /// Revivals performed since the node was (re)created.
    pub revival_attempts: u32,

    /// Delay before the next revival attempt.
    pub revival_delay_secs: u64,

    /// Wall-clock time of the last spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_at: Option<DateTime<Utc>>,
}

impl NodeStatus {
    /// Placeholder snapshot for a node that has been accepted but not yet
    /// reported on.
    pub fn pending(config: NodeConfig) -> Self {
        Self {
            config,
            state: NodeState::Pending,
            pid: 0,
            killed: false,
            exit_status: 0,
            signal_number: 0,
            revival_attempts: 0,
            revival_delay_secs: 0,
            spawned_at: None,
        }
    }

    /// Name of the node.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether a process is currently running.
    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running && self.pid > 0
    }
}
