//! # nodetree-proto
//!
//! Data model and message contract shared by the Supervisor and the Stem.
//!
//! ## Contents
//!
//! - `NodeConfig` / `ClusterEndpoint`: declarative description of a supervised node
//! - `NodeStatus` / `NodeState`: snapshots of a node's runtime record
//! - `Target`: a single named node or every node
//! - `Message`: requests and replies exchanged over the IPC channel
//! - `MessageBuffer`: newline-delimited JSON framing with reassembly
//!
//! ## Wire Format
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"create","config":{"name":"worker-1","scripts":[],"cluster":{}}}
//! {"type":"ack","ok":true}
//! {"type":"status_request","target":{"scope":"all"}}
//! {"type":"status_reply","nodes":[...]}
//! ```

mod codec;
mod config;
mod error;
mod message;
mod status;

pub use codec::{encode, MessageBuffer, MAX_MESSAGE_BYTES};
pub use config::{ClusterEndpoint, ClusterRole, NodeConfig};
pub use error::ProtoError;
pub use message::{Message, Target};
pub use status::{NodeState, NodeStatus};
