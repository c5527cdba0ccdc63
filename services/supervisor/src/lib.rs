//! nodetree supervision tree.
//!
//! A Supervisor keeps one Stem process alive; the Stem forks, watches and
//! revives named nodes.
//!
//! ## Architecture
//!
//! - **Supervisor** (`supervisor`): command surface (create, destroy,
//!   restart, status), Stem launch by re-exec, relaunch and replay
//! - **Stem** (`stem`): single-threaded loop owning the node registry,
//!   reaping children and scheduling revivals
//! - **IPC** (`ipc`): newline-delimited JSON over a pipe pair
//! - **Liveness** (`liveness`): every process exits once its parent is gone
//! - **Node body** (`node`): what a forked node runs

pub mod config;
pub mod error;
pub mod event_loop;
pub mod flare;
pub mod ipc;
pub mod liveness;
pub mod logging;
pub mod node;
pub mod registry;
pub mod spawn;
pub mod stem;
pub mod supervisor;

pub use config::{Config, StemSettings};
pub use error::SupervisorError;
pub use event_loop::{EventLoop, IoSource};
pub use liveness::{Liveness, ParentLivenessMonitor};
pub use spawn::SupervisedNode;
pub use stem::{Stem, StemOutcome};
pub use supervisor::{NodeMap, Status, StemHealth, Supervisor};
