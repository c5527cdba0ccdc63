//! End-to-end lifecycle tests.
//!
//! Each test launches a real Stem by re-executing the `nodetree` binary and
//! drives the Supervisor through its public command surface.

mod common;

use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nodetree_proto::NodeState;
use nodetree_supervisor::{EventLoop, StemHealth, Supervisor, SupervisorError};
use serde_json::json;

use common::*;

const SETTLE: Duration = Duration::from_secs(10);

#[test]
fn test_create_revive_destroy() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert_eq!(sup.create(node("worker-1")), "");

    let status = sup.status("worker-1");
    let first = status.get("worker-1").unwrap().clone();
    assert_eq!(first.state, NodeState::Running);
    assert!(first.pid > 0);
    assert!(!first.killed);
    assert_eq!(first.revival_attempts, 0);

    kill(pid(first.pid), Signal::SIGKILL).unwrap();

    let status = wait_for(&mut sup, "worker-1", SETTLE, |s| {
        s.get("worker-1")
            .is_some_and(|n| n.revival_attempts == 1 && n.pid > 0 && n.pid != first.pid)
    });
    let revived = status.get("worker-1").unwrap();
    assert_eq!(revived.state, NodeState::Running);
    assert_eq!(revived.signal_number, Signal::SIGKILL as i32);

    let revived_pid = revived.pid;
    assert!(sup.destroy("worker-1"));
    assert!(sup.status("").get("worker-1").is_none());
    assert!(wait_gone(revived_pid, SETTLE));

    // A destroyed node is never revived.
    std::thread::sleep(Duration::from_millis(1500));
    let status = wait_for(&mut sup, "", SETTLE, |_| true);
    assert!(status.nodes.is_empty());
}

#[test]
fn test_duplicate_create_leaves_node_unchanged() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert_eq!(sup.create(node("worker-1")), "");
    let before = sup.status("worker-1").get("worker-1").unwrap().clone();

    let err = sup.create(node("worker-1"));
    assert!(err.contains("already exists"), "unexpected error: {}", err);

    let after = sup.status("worker-1").get("worker-1").unwrap().clone();
    assert_eq!(after.pid, before.pid);
    assert_eq!(after.config, before.config);
    assert_eq!(after.revival_attempts, 0);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert!(!sup.create(node("")).is_empty());
    assert!(!sup
        .create_value(&json!({"name": "worker-1", "unknown_field": true}))
        .is_empty());
    assert!(!sup.create_value(&json!({"cluster": {}})).is_empty());
    assert!(sup.status("").nodes.is_empty());

    assert_eq!(
        sup.create_value(&json!({
            "name": "worker-1",
            "cluster": {
                "worker-1": {"role": "worker", "host": "127.0.0.1", "port": 27760}
            }
        })),
        ""
    );
    let status = sup.status("worker-1");
    assert_eq!(status.get("worker-1").unwrap().config.cluster.len(), 1);
}

#[test]
fn test_unknown_targets_fail() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert!(!sup.destroy("missing"));
    assert!(!sup.restart("missing"));
    assert!(sup.status("missing").nodes.is_empty());

    // An empty tree accepts wildcard commands.
    assert!(sup.destroy(""));
    assert!(sup.restart(""));
}

#[test]
fn test_restart_replaces_process() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert_eq!(sup.create(node("worker-1")), "");
    let before = sup.status("worker-1").get("worker-1").unwrap().clone();

    assert!(sup.restart("worker-1"));
    let after = sup.status("worker-1").get("worker-1").unwrap().clone();

    assert_eq!(after.state, NodeState::Running);
    assert!(after.pid > 0);
    assert_ne!(after.pid, before.pid);
    assert_eq!(after.revival_attempts, 0);
    assert!(!after.killed);
    assert!(wait_gone(before.pid, SETTLE));
}

#[test]
fn test_destroy_all() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(sup.create(node(name)), "");
    }
    let pids: Vec<i32> = sup.status("").nodes.values().map(|n| n.pid).collect();
    assert_eq!(pids.len(), 3);

    assert!(sup.destroy(""));
    assert!(sup.status("").nodes.is_empty());
    for p in pids {
        assert!(wait_gone(p, SETTLE), "node {} still running", p);
    }
}

#[test]
fn test_stem_death_replays_nodes() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    let mut worker = node("worker-1");
    worker.scripts = vec!["local.zeek".to_string()];
    assert_eq!(sup.create(worker), "");
    assert_eq!(sup.create(node("worker-2")), "");

    let before = sup.status("");
    let old_stem = sup.stem_pid().unwrap();

    kill(old_stem, Signal::SIGKILL).unwrap();

    let after = wait_for(&mut sup, "", SETTLE, |s| {
        s.nodes.len() == 2
            && s.nodes.values().all(|n| {
                n.state == NodeState::Running && n.pid != before.get(&n.config.name).unwrap().pid
            })
    });

    assert_eq!(after.health, StemHealth::Healthy);
    assert_ne!(sup.stem_pid().unwrap(), old_stem);
    for (name, status) in &after.nodes {
        assert_eq!(status.config, before.get(name).unwrap().config);
    }

    // Nodes of the dead Stem notice they were orphaned.
    for old in before.nodes.values() {
        assert!(wait_gone(old.pid, SETTLE), "orphaned node {} still running", old.pid);
    }
}

#[test]
fn test_shutdown_terminates_tree() {
    let _guard = serial();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    assert_eq!(sup.create(node("worker-1")), "");
    let node_pid = sup.status("worker-1").get("worker-1").unwrap().pid;
    let stem_pid = sup.stem_pid().unwrap();

    sup.shutdown();
    assert!(sup.stem_pid().is_none());
    assert!(!process_alive(stem_pid.as_raw()));
    assert!(wait_gone(node_pid, SETTLE));

    // Idempotent.
    sup.shutdown();
}

#[test]
fn test_missing_executable_fails_launch() {
    let _guard = serial();
    let result = Supervisor::launch(test_config("/nonexistent/nodetree"));
    let err = result.err().unwrap();
    assert!(matches!(err, SupervisorError::LaunchFailed(_)));
}

#[test]
fn test_relaunch_failure_reports_unhealthy() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("nodetree");
    std::fs::copy(nodetree_exe(), &exe).unwrap();

    let mut config = test_config(&exe);
    config.relaunch_max_retries = 0;
    let mut sup = Supervisor::launch(config).unwrap();
    assert_eq!(sup.create(node("worker-1")), "");

    std::fs::remove_file(&exe).unwrap();
    kill(sup.stem_pid().unwrap(), Signal::SIGKILL).unwrap();

    let status = wait_for(&mut sup, "", SETTLE, |s| {
        matches!(s.health, StemHealth::Unhealthy { .. })
    });
    // The mirror still remembers what to replay.
    assert!(status.get("worker-1").is_some());
    assert!(!sup.create(node("worker-2")).is_empty());

    std::fs::copy(nodetree_exe(), &exe).unwrap();
    let status = wait_for(&mut sup, "", SETTLE, |s| {
        s.health.is_healthy() && s.get("worker-1").is_some_and(|n| n.pid > 0)
    });
    assert_eq!(status.nodes.len(), 1);
}

#[test]
fn test_node_output_redirection() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let mut sup = Supervisor::launch(test_config(nodetree_exe())).unwrap();

    let mut worker = node("worker-1");
    worker.directory = Some(dir.path().join("spool").display().to_string());
    worker.stdout_file = Some("stdout.log".to_string());
    worker.stderr_file = Some("stderr.log".to_string());
    assert_eq!(sup.create(worker), "");

    let stdout = dir.path().join("spool/stdout.log");
    let stderr = dir.path().join("spool/stderr.log");
    let started = std::time::Instant::now();
    loop {
        let logged = std::fs::read_to_string(&stderr).unwrap_or_default();
        if logged.contains("node started") {
            assert!(logged.contains("worker-1"));
            break;
        }
        assert!(started.elapsed() < SETTLE, "node never logged to {:?}", stderr);
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(stdout.exists());
}

#[test]
fn test_destroy_stops_hung_nodes_together() {
    let _guard = serial();
    let mut config = test_config(nodetree_exe());
    config.stem.terminate_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(4);
    let mut sup = Supervisor::launch(config).unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(sup.create(node(name)), "");
    }
    let pids: Vec<i32> = sup.status("").nodes.values().map(|n| n.pid).collect();
    assert_eq!(pids.len(), 3);
    let stem = sup.stem_pid().unwrap();

    // Stopped processes ignore SIGTERM until SIGKILL arrives.
    for &p in &pids {
        kill(pid(p), Signal::SIGSTOP).unwrap();
    }

    let started = Instant::now();
    assert!(sup.destroy(""));
    assert!(started.elapsed() < Duration::from_secs(4));
    for &p in &pids {
        assert!(wait_gone(p, SETTLE), "node {} still running", p);
    }

    std::thread::sleep(Duration::from_millis(1500));
    let status = wait_for(&mut sup, "", SETTLE, |_| true);
    assert!(status.nodes.is_empty());
    assert_eq!(status.health, StemHealth::Healthy);
    assert_eq!(sup.stem_pid(), Some(stem));
}

#[test]
fn test_destroy_is_not_replayed_after_stem_loss() {
    let _guard = serial();
    let mut config = test_config(nodetree_exe());
    config.request_timeout = Duration::from_secs(3);
    let mut sup = Supervisor::launch(config).unwrap();

    assert_eq!(sup.create(node("a")), "");
    assert_eq!(sup.create(node("b")), "");
    let a_pid = sup.status("a").get("a").unwrap().pid;
    let old_stem = sup.stem_pid().unwrap();

    // A frozen Stem never answers; the request times out and the Stem is replaced.
    kill(old_stem, Signal::SIGSTOP).unwrap();
    assert!(!sup.destroy("a"));

    let status = wait_for(&mut sup, "", SETTLE, |s| {
        s.health.is_healthy() && s.get("b").is_some_and(|n| n.state == NodeState::Running)
    });
    assert!(status.get("a").is_none());
    assert_ne!(sup.stem_pid().unwrap(), old_stem);
    assert!(wait_gone(a_pid, SETTLE));
}

#[test]
fn test_stem_that_never_serves_fails_launch() {
    let _guard = serial();
    let err = Supervisor::launch(test_config("/bin/true")).err().unwrap();
    assert!(matches!(err, SupervisorError::LaunchFailed(_)), "{:?}", err);
}

#[test]
fn test_crashing_stem_backs_off() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("nodetree");
    std::fs::copy(nodetree_exe(), &exe).unwrap();

    let mut sup = Supervisor::launch(test_config(&exe)).unwrap();
    assert_eq!(sup.create(node("worker-1")), "");

    // The replacement starts but exits before serving the channel.
    std::fs::remove_file(&exe).unwrap();
    write_script(&exe, "exit 0");
    kill(sup.stem_pid().unwrap(), Signal::SIGKILL).unwrap();

    let event_loop = EventLoop::new(Duration::from_millis(50));
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(3) {
        event_loop.run_once(&mut sup).unwrap();
        assert!(sup.stem_pid().is_none());
    }

    // Attempts at roughly 0s, 1s and 3s: backoff, not a relaunch per turn.
    match sup.health() {
        StemHealth::Relaunching { failures } | StemHealth::Unhealthy { failures, .. } => {
            assert!((2..=4).contains(failures), "failures: {}", failures);
        }
        StemHealth::Healthy => panic!("crashing stem reported healthy"),
    }
    assert!(sup.nodes().contains_key("worker-1"));
}
