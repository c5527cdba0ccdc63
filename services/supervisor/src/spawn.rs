//! Forking nodes and stopping processes.

use std::fs::{self, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, fork, ForkResult, Pid};
use nodetree_proto::{ClusterEndpoint, NodeConfig};
use tracing::{debug, warn};

use crate::error::SupervisorError;
use crate::liveness::ParentLivenessMonitor;
use crate::registry::ProcessExit;

/// Exit code of a node whose pre-run setup failed.
pub const CHILD_SETUP_FAILED: i32 = 13;

/// Environment variable carrying the node's own name.
pub const NODE_NAME_ENV: &str = "CLUSTER_NODE";

const OUTPUT_FILE_MODE: u32 = 0o644;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a freshly forked node process needs to run its body.
#[derive(Debug, Clone)]
pub struct SupervisedNode {
    pub config: NodeConfig,
    /// The Stem that forked us.
    pub parent_pid: Pid,
    pub parent_check_interval: Duration,
}

impl SupervisedNode {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn liveness_monitor(&self) -> ParentLivenessMonitor {
        ParentLivenessMonitor::new(self.parent_pid, self.parent_check_interval)
    }

    /// Every cluster member, including this node.
    pub fn cluster_layout(&self) -> impl Iterator<Item = (&String, &ClusterEndpoint)> {
        self.config.cluster.iter()
    }

    /// This node's own entry in the cluster layout, if it has one.
    pub fn local_endpoint(&self) -> Option<&ClusterEndpoint> {
        self.config.cluster.get(&self.config.name)
    }
}

/// Which side of a fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent(Pid),
    Child,
}

/// Fork the current process.
///
/// The caller must be single-threaded.
pub fn fork_node() -> Result<ForkOutcome, SupervisorError> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(ForkOutcome::Parent(child)),
        ForkResult::Child => Ok(ForkOutcome::Child),
    }
}

/// Apply a node's process-level configuration in the child.
///
/// Changes directory first, so relative output paths land inside it.
pub fn prepare_child(config: &NodeConfig) -> Result<(), SupervisorError> {
    if let Some(dir) = &config.directory {
        fs::create_dir_all(dir)?;
        chdir(dir.as_str())?;
    }

    if let Some(path) = &config.stdout_file {
        redirect_output(path, libc::STDOUT_FILENO)?;
    }
    if let Some(path) = &config.stderr_file {
        redirect_output(path, libc::STDERR_FILENO)?;
    }

    if let Some(cpu) = config.cpu_affinity {
        if let Err(e) = set_cpu_affinity(cpu) {
            warn!(node = %config.name, cpu, error = %e, "failed to set CPU affinity");
        }
    }

    std::env::set_var(NODE_NAME_ENV, &config.name);
    Ok(())
}

fn redirect_output(path: &str, target: i32) -> Result<(), SupervisorError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(OUTPUT_FILE_MODE)
        .open(path)?;
    dup2(file.as_raw_fd(), target)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: u32) -> Result<(), SupervisorError> {
    use nix::sched::{sched_setaffinity, CpuSet};

    let mut set = CpuSet::new();
    set.set(cpu as usize)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: u32) -> Result<(), SupervisorError> {
    Err(SupervisorError::InvalidConfig(
        "CPU affinity is not supported on this platform".to_string(),
    ))
}

/// Map a wait status to a process exit, if the process is gone.
pub fn exit_of(status: WaitStatus) -> Option<ProcessExit> {
    match status {
        WaitStatus::Exited(_, code) => Some(ProcessExit::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ProcessExit::Signaled(signal as i32)),
        _ => None,
    }
}

/// Stop a child process: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Always reaps. Returns `None` if the process had already been reaped
/// elsewhere.
pub fn terminate_process(pid: Pid, grace: Duration) -> Option<ProcessExit> {
    terminate_processes(&[pid], grace)
        .into_iter()
        .next()
        .and_then(|(_, exit)| exit)
}

/// Stop several child processes against one shared deadline.
///
/// Every process gets SIGTERM up front, so the whole batch takes at most
/// `grace` plus the SIGKILL round. Returns one entry per pid, in reap order.
pub fn terminate_processes(pids: &[Pid], grace: Duration) -> Vec<(Pid, Option<ProcessExit>)> {
    for &pid in pids {
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "failed to send SIGTERM"),
        }
    }

    let mut reaped = Vec::with_capacity(pids.len());
    let mut remaining = pids.to_vec();
    let deadline = Instant::now() + grace;
    loop {
        remaining.retain(|&pid| match try_reap(pid) {
            Some(exit) => {
                reaped.push((pid, exit));
                false
            }
            None => true,
        });

        if remaining.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(REAP_POLL_INTERVAL);
    }

    for pid in remaining {
        warn!(
            pid = pid.as_raw(),
            grace_ms = grace.as_millis() as u64,
            "process ignored SIGTERM, sending SIGKILL"
        );
        let _ = kill(pid, Signal::SIGKILL);
        reaped.push((pid, reap_blocking(pid)));
    }
    reaped
}

/// Non-blocking reap. `None` while the process is still running; `Some(None)`
/// if it is not our child (any more).
fn try_reap(pid: Pid) -> Option<Option<ProcessExit>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => return exit_of(status).map(Some),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "process already reaped");
                return Some(None);
            }
        }
    }
}

fn reap_blocking(pid: Pid) -> Option<ProcessExit> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = exit_of(status) {
                    return Some(exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "process already reaped");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    use nodetree_proto::ClusterRole;

    fn spawn(program: &str, args: &[&str]) -> Pid {
        let child = Command::new(program).args(args).spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_terminate_cooperative_process() {
        let pid = spawn("sleep", &["30"]);
        let exit = terminate_process(pid, Duration::from_secs(5));
        assert_eq!(exit, Some(ProcessExit::Signaled(Signal::SIGTERM as i32)));
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let pid = spawn("sh", &["-c", "trap '' TERM; sleep 30"]);
        // Let the shell install its trap.
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let exit = terminate_process(pid, Duration::from_millis(200));
        assert_eq!(exit, Some(ProcessExit::Signaled(Signal::SIGKILL as i32)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_terminate_batch_shares_deadline() {
        let stubborn: Vec<Pid> = (0..3)
            .map(|_| spawn("sh", &["-c", "trap '' TERM; sleep 30"]))
            .collect();
        let polite = spawn("sleep", &["30"]);
        thread::sleep(Duration::from_millis(200));

        let mut pids = stubborn.clone();
        pids.push(polite);

        let started = Instant::now();
        let exits = terminate_processes(&pids, Duration::from_millis(500));
        // One grace period for the batch, not one per process.
        assert!(started.elapsed() < Duration::from_millis(1200));

        assert_eq!(exits.len(), 4);
        for pid in &stubborn {
            let (_, exit) = exits.iter().find(|(p, _)| p == pid).unwrap();
            assert_eq!(*exit, Some(ProcessExit::Signaled(Signal::SIGKILL as i32)));
        }
        let (_, exit) = exits.iter().find(|(p, _)| *p == polite).unwrap();
        assert_eq!(*exit, Some(ProcessExit::Signaled(Signal::SIGTERM as i32)));
    }

    #[test]
    fn test_terminate_already_reaped() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(terminate_process(pid, Duration::from_millis(50)), None);
    }

    #[test]
    fn test_local_endpoint() {
        let mut config = NodeConfig::new("worker-1");
        config.cluster.insert(
            "worker-1".to_string(),
            ClusterEndpoint {
                role: ClusterRole::Worker,
                host: "127.0.0.1".to_string(),
                port: 27760,
                interface: None,
            },
        );
        config.cluster.insert(
            "manager".to_string(),
            ClusterEndpoint {
                role: ClusterRole::Manager,
                host: "127.0.0.1".to_string(),
                port: 27761,
                interface: None,
            },
        );

        let node = SupervisedNode {
            config,
            parent_pid: Pid::from_raw(1),
            parent_check_interval: Duration::from_secs(1),
        };
        assert_eq!(node.local_endpoint().unwrap().port, 27760);
        assert_eq!(node.cluster_layout().count(), 2);
    }
}
