//! Default node body.
//!
//! A forked node runs here until it is told to stop or its Stem disappears.
//! The body announces its cluster layout and otherwise idles; embedders with
//! real work replace it.

use std::process::ExitCode;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::liveness::Liveness;
use crate::spawn::SupervisedNode;

/// Exit code of a node whose Stem disappeared.
pub const ORPHANED_EXIT_CODE: u8 = 1;

/// Run the node body on a fresh single-threaded runtime.
pub fn run(node: SupervisedNode) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(node = %node.name(), error = %e, "failed to start node runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(node)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "node failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(node: SupervisedNode) -> anyhow::Result<u8> {
    info!(
        node = %node.name(),
        pid = std::process::id(),
        parent_pid = node.parent_pid.as_raw(),
        interface = ?node.config.interface,
        scripts = ?node.config.scripts,
        peers = node.config.cluster.len(),
        "node started"
    );

    if let Some(local) = node.local_endpoint() {
        info!(role = %local.role, host = %local.host, port = local.port, "cluster role");
    }
    for (peer, endpoint) in node.cluster_layout() {
        debug!(
            peer = %peer,
            role = %endpoint.role,
            host = %endpoint.host,
            port = endpoint.port,
            "cluster peer"
        );
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let monitor = node.liveness_monitor();
    debug!(
        parent_pid = monitor.parent_pid().as_raw(),
        interval_ms = monitor.interval().as_millis() as u64,
        "watching parent"
    );

    tokio::select! {
        liveness = monitor.watch() => {
            if let Liveness::Orphaned { current_parent } = liveness {
                warn!(
                    node = %node.name(),
                    current_parent = current_parent.as_raw(),
                    "stem is gone, node exiting"
                );
            }
            Ok(ORPHANED_EXIT_CODE)
        }
        _ = sigterm.recv() => {
            info!(node = %node.name(), "received SIGTERM, shutting down");
            Ok(0)
        }
        _ = sigint.recv() => {
            info!(node = %node.name(), "received SIGINT, shutting down");
            Ok(0)
        }
    }
}
