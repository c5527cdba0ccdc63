//! Shared helpers for supervision tree integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use nodetree_proto::{NodeConfig, Target};
use nodetree_supervisor::{Config, EventLoop, Status, Supervisor};

/// Only one Supervisor may own the process's signal handlers at a time.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn nodetree_exe() -> &'static str {
    env!("CARGO_BIN_EXE_nodetree")
}

/// Config with short intervals suitable for tests.
pub fn test_config(exe: impl AsRef<Path>) -> Config {
    let mut config = Config::new(exe.as_ref());
    config.stem.parent_check_interval = Duration::from_millis(100);
    config.stem.terminate_timeout = Duration::from_secs(2);
    config.stem_shutdown_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(10);
    config
}

pub fn node(name: &str) -> NodeConfig {
    NodeConfig::new(name)
}

/// Drive the Supervisor until `done` holds for a status of `target`.
pub fn wait_for(
    supervisor: &mut Supervisor,
    target: &str,
    timeout: Duration,
    mut done: impl FnMut(&Status) -> bool,
) -> Status {
    let event_loop = EventLoop::new(Duration::from_millis(50));
    let started = Instant::now();
    loop {
        event_loop.run_once(supervisor).unwrap();
        let status = supervisor.status(Target::from(target));
        if done(&status) {
            return status;
        }
        if started.elapsed() > timeout {
            panic!("condition not met within {:?}; last status: {:#?}", timeout, status);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// True if `pid` names a live, non-zombie process.
pub fn process_alive(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state follows the parenthesized command name.
    match stat.rfind(')') {
        Some(idx) => !matches!(stat[idx + 1..].trim_start().chars().next(), Some('Z') | Some('X')),
        None => false,
    }
}

/// Wait for `pid` to exit.
pub fn wait_gone(pid: i32, timeout: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if !process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

pub fn pid(raw: i32) -> Pid {
    Pid::from_raw(raw)
}

/// Write an executable shell script to `path`.
pub fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
