//! Signal delivery through a self-pipe.
//!
//! The handler only records the signal number in an atomic bitmask and
//! writes one byte to a non-blocking pipe. The event loop polls the read end
//! and does the real work (reaping, shutdown) outside signal context.
//!
//! Only one flare can be installed per process at a time.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;

use crate::error::SupervisorError;

static FLARE_FD: AtomicI32 = AtomicI32::new(-1);
static PENDING: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    if (0..64).contains(&signo) {
        PENDING.fetch_or(1u64 << signo, Ordering::SeqCst);
    }

    let fd = FLARE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let saved = Errno::last_raw();
        let byte = 1u8;
        // A full pipe already wakes the reader.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
        Errno::set_raw(saved);
    }
}

/// Set of signals received since the last `SignalFlare::take`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSignals(u64);

impl PendingSignals {
    /// Returns true if `signal` was received.
    pub fn contains(&self, signal: Signal) -> bool {
        let signo = signal as i32;
        (0..64).contains(&signo) && self.0 & (1u64 << signo) != 0
    }

    /// Returns true if no signal was received.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Installed signal handlers plus the pipe they write to.
///
/// Dropping the flare restores the previous dispositions.
pub struct SignalFlare {
    reader: File,
    _writer: OwnedFd,
    previous: Vec<(Signal, SigAction)>,
}

impl SignalFlare {
    /// Route `signals` through a new flare.
    pub fn install(signals: &[Signal]) -> Result<Self, SupervisorError> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;

        if FLARE_FD
            .compare_exchange(-1, writer.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::FlareInstalled);
        }
        PENDING.store(0, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );

        let mut previous = Vec::with_capacity(signals.len());
        for &signal in signals {
            match unsafe { sigaction(signal, &action) } {
                Ok(old) => previous.push((signal, old)),
                Err(e) => {
                    restore(&previous);
                    FLARE_FD.store(-1, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            reader: File::from(reader),
            _writer: writer,
            previous,
        })
    }

    /// Read end of the pipe, readable while a signal is pending.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Returns true if a signal arrived since the last `take`.
    pub fn is_pending(&self) -> bool {
        PENDING.load(Ordering::SeqCst) != 0
    }

    /// Drain the pipe and return the signals received since the last call.
    pub fn take(&mut self) -> PendingSignals {
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        PendingSignals(PENDING.swap(0, Ordering::SeqCst))
    }
}

impl Drop for SignalFlare {
    fn drop(&mut self) {
        restore(&self.previous);
        FLARE_FD.store(-1, Ordering::SeqCst);
        PENDING.store(0, Ordering::SeqCst);
    }
}

fn restore(previous: &[(Signal, SigAction)]) {
    for (signal, action) in previous {
        unsafe {
            let _ = sigaction(*signal, action);
        }
    }
}
