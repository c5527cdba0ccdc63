//! Poll-based event loop integration.
//!
//! The Supervisor does not own a thread. It exposes itself as an `IoSource`
//! so a host program can fold it into its own loop, or drive it with
//! `EventLoop::run_once`.

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;

use crate::error::SupervisorError;

/// Something an event loop can wait on.
pub trait IoSource {
    /// Short name for logging.
    fn tag(&self) -> &'static str;

    /// Descriptors whose readability means `process` has work to do.
    fn read_fds(&self) -> Vec<BorrowedFd<'_>>;

    /// When `process` must run next even without readable descriptors.
    ///
    /// A time at or before now means work is already pending.
    fn next_timestamp(&self) -> Option<Instant>;

    /// Handle whatever is ready. Must not block.
    fn process(&mut self) -> Result<(), SupervisorError>;
}

/// Minimal single-source loop.
#[derive(Debug, Clone, Copy)]
pub struct EventLoop {
    max_wait: Duration,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl EventLoop {
    /// Create a loop that never sleeps longer than `max_wait` per turn.
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    /// Wait until `source` is ready or due, then process it once.
    pub fn run_once<S: IoSource + ?Sized>(&self, source: &mut S) -> Result<(), SupervisorError> {
        let now = Instant::now();
        let wait = match source.next_timestamp() {
            Some(at) => at.saturating_duration_since(now).min(self.max_wait),
            None => self.max_wait,
        };

        if !wait.is_zero() {
            trace!(
                source = source.tag(),
                wait_ms = wait.as_millis() as u64,
                "waiting for source"
            );
            let fds = source.read_fds();
            poll_readable(&fds, wait)?;
        }

        source.process()
    }
}

/// Wait up to `timeout` for any of `fds` to become readable.
///
/// Returns per-descriptor readiness. Hang-up and error count as readable so
/// the caller observes EOF on its next read. An interrupted wait reports
/// nothing ready.
pub fn poll_readable(
    fds: &[BorrowedFd<'_>],
    timeout: Duration,
) -> Result<Vec<bool>, SupervisorError> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    match poll(&mut poll_fds, PollTimeout::from(millis)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e.into()),
    }

    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(poll_fds
        .iter()
        .map(|p| p.revents().is_some_and(|r| r.intersects(ready)))
        .collect())
}
