//! Messages exchanged between the Supervisor and the Stem.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::status::NodeStatus;

/// Which nodes a command applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// A single node, by name.
    One(String),
    /// Every node in the tree.
    All,
}

impl Target {
    /// Resolve a command-surface name where the empty string means every node.
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() {
            Target::All
        } else {
            Target::One(name.to_string())
        }
    }

    /// Returns true if `name` is selected by this target.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Target::One(n) => n == name,
            Target::All => true,
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::from_name(name)
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::from_name(&name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::One(name) => write!(f, "{}", name),
            Target::All => write!(f, "*"),
        }
    }
}

/// A single IPC message.
///
/// Requests flow Supervisor → Stem and each receives exactly one reply
/// (`Ack` or `StatusReply`) in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Create and spawn a new node.
    Create { config: NodeConfig },

    /// Terminate and remove nodes.
    Destroy { target: Target },

    /// Terminate and re-create nodes from their stored config.
    Restart { target: Target },

    /// Request node snapshots.
    StatusRequest { target: Target },

    /// Node snapshots.
    StatusReply { nodes: Vec<NodeStatus> },

    /// Outcome of a create/destroy/restart request.
    Ack {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    /// Successful acknowledgment.
    pub fn ok() -> Self {
        Message::Ack {
            ok: true,
            error: None,
        }
    }

    /// Failed acknowledgment with a human-readable reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Message::Ack {
            ok: false,
            error: Some(error.into()),
        }
    }

    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Create { .. } => "create",
            Message::Destroy { .. } => "destroy",
            Message::Restart { .. } => "restart",
            Message::StatusRequest { .. } => "status_request",
            Message::StatusReply { .. } => "status_reply",
            Message::Ack { .. } => "ack",
        }
    }

    /// Returns true for messages sent in reply to a request.
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::StatusReply { .. } | Message::Ack { .. })
    }
}
