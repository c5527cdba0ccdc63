//! Parent liveness checks.
//!
//! Stems and nodes must not outlive their parent. When a parent dies the
//! kernel reparents the child, so `getppid()` stops matching the pid recorded
//! at spawn time. A signal-0 probe of the recorded pid covers the window where
//! the parent is gone but reparenting has not been observed yet.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The recorded parent is still our parent.
    Alive,
    /// The recorded parent is gone.
    Orphaned { current_parent: Pid },
}

impl Liveness {
    pub fn is_orphaned(&self) -> bool {
        matches!(self, Liveness::Orphaned { .. })
    }
}

/// Periodic check that the process that spawned us still exists.
#[derive(Debug, Clone)]
pub struct ParentLivenessMonitor {
    parent_pid: Pid,
    interval: Duration,
    next_check: Instant,
}

impl ParentLivenessMonitor {
    /// Monitor `parent_pid`, checking at most once per `interval`.
    pub fn new(parent_pid: Pid, interval: Duration) -> Self {
        Self {
            parent_pid,
            interval,
            next_check: Instant::now(),
        }
    }

    /// The pid recorded at spawn time.
    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    /// Check interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check now, regardless of the interval.
    pub fn check(&self) -> Liveness {
        let current_parent = getppid();
        if current_parent != self.parent_pid {
            return Liveness::Orphaned { current_parent };
        }

        match kill(self.parent_pid, None) {
            Err(Errno::ESRCH) => Liveness::Orphaned { current_parent },
            _ => Liveness::Alive,
        }
    }

    /// Check if the interval has elapsed at `now`; otherwise report alive.
    pub fn poll(&mut self, now: Instant) -> Liveness {
        if now < self.next_check {
            return Liveness::Alive;
        }
        self.next_check = now + self.interval;
        self.check()
    }

    /// When `poll` will next perform a real check.
    pub fn next_deadline(&self) -> Instant {
        self.next_check
    }

    /// Resolve once the parent is gone.
    pub async fn watch(self) -> Liveness {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let liveness = self.check();
            if liveness.is_orphaned() {
                return liveness;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_real_parent_is_alive() {
        let monitor = ParentLivenessMonitor::new(getppid(), Duration::from_secs(1));
        assert_eq!(monitor.check(), Liveness::Alive);
    }

    #[test]
    fn test_wrong_parent_is_orphaned() {
        // We are never our own parent.
        let monitor = ParentLivenessMonitor::new(getpid(), Duration::from_secs(1));
        let liveness = monitor.check();
        assert_eq!(
            liveness,
            Liveness::Orphaned {
                current_parent: getppid()
            }
        );
        assert!(liveness.is_orphaned());
    }

    #[test]
    fn test_poll_respects_interval() {
        let mut monitor = ParentLivenessMonitor::new(getpid(), Duration::from_secs(60));
        let now = Instant::now();

        assert!(monitor.poll(now).is_orphaned());
        assert_eq!(monitor.next_deadline(), now + Duration::from_secs(60));

        // Not due yet: no check performed.
        assert_eq!(monitor.poll(now + Duration::from_secs(1)), Liveness::Alive);
        assert!(monitor.poll(now + Duration::from_secs(60)).is_orphaned());
    }

    #[tokio::test]
    async fn test_watch_resolves_when_orphaned() {
        let monitor = ParentLivenessMonitor::new(getpid(), Duration::from_millis(10));
        let liveness = tokio::time::timeout(Duration::from_secs(5), monitor.watch())
            .await
            .unwrap();
        assert!(liveness.is_orphaned());
    }
}
