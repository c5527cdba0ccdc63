//! Error types for the supervision tree.

use std::time::Duration;

use nodetree_proto::ProtoError;
use thiserror::Error;

/// Supervision errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A node with the same name is already registered.
    #[error("node with name '{0}' already exists")]
    DuplicateNode(String),

    /// No node with the given name is registered.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Node or process configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The Stem executable could not be started.
    #[error("stem_launch_failed: {0}")]
    LaunchFailed(String),

    /// No Stem is currently running to serve the request.
    #[error("stem_unavailable: {0}")]
    StemUnavailable(String),

    /// The other end of the IPC channel closed.
    #[error("peer closed the channel")]
    PeerGone,

    /// No reply arrived within the request timeout.
    #[error("timed out after {0:?} waiting for reply")]
    Timeout(Duration),

    /// The peer answered with the wrong kind of message.
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: &'static str,
    },

    /// Another signal flare is already installed in this process.
    #[error("signal flare already installed")]
    FlareInstalled,

    /// Wire protocol error.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}

impl SupervisorError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SupervisorError::DuplicateNode(_) => "duplicate_node",
            SupervisorError::UnknownNode(_) => "unknown_node",
            SupervisorError::InvalidConfig(_) => "invalid_config",
            SupervisorError::LaunchFailed(_) => "stem_launch_failed",
            SupervisorError::StemUnavailable(_) => "stem_unavailable",
            SupervisorError::PeerGone => "peer_gone",
            SupervisorError::Timeout(_) => "timeout",
            SupervisorError::UnexpectedReply { .. } => "unexpected_reply",
            SupervisorError::FlareInstalled => "flare_installed",
            SupervisorError::Proto(_) => "proto_error",
            SupervisorError::Io(_) => "io_error",
            SupervisorError::Syscall(_) => "syscall_error",
        }
    }

    /// Returns true if the channel this error came from is unusable.
    ///
    /// A closed pipe, an undecodable line and a missing reply all leave the
    /// request/reply stream out of step, so the peer has to be replaced.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            SupervisorError::PeerGone | SupervisorError::Timeout(_) => true,
            SupervisorError::Proto(ProtoError::MalformedMessage(_))
            | SupervisorError::Proto(ProtoError::MessageTooLarge { .. }) => true,
            SupervisorError::Io(e) => e.kind() == std::io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            SupervisorError::DuplicateNode("w1".into()).reason_code(),
            "duplicate_node"
        );
        assert_eq!(SupervisorError::PeerGone.reason_code(), "peer_gone");
        assert_eq!(
            SupervisorError::Syscall(nix::Error::EPERM).reason_code(),
            "syscall_error"
        );
    }

    #[test]
    fn test_duplicate_message_names_node() {
        let msg = SupervisorError::DuplicateNode("worker-1".into()).to_string();
        assert!(msg.contains("worker-1"));
        assert!(msg.contains("already exists"));
    }

    #[test]
    fn test_transport_failures() {
        assert!(SupervisorError::PeerGone.is_transport_failure());
        assert!(SupervisorError::Timeout(Duration::from_secs(1)).is_transport_failure());
        assert!(
            SupervisorError::Proto(ProtoError::MalformedMessage("x".into()))
                .is_transport_failure()
        );
        assert!(!SupervisorError::UnknownNode("w1".into()).is_transport_failure());
        assert!(!SupervisorError::InvalidConfig("bad".into()).is_transport_failure());
    }
}
