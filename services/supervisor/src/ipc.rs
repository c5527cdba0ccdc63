//! Supervisor ↔ Stem channel over a pair of pipes.
//!
//! The read end is non-blocking and drained into a `MessageBuffer`; writes
//! are blocking. Each side owns one read end and one write end.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;
use nodetree_proto::{encode, Message, MessageBuffer, ProtoError};

use crate::error::SupervisorError;
use crate::event_loop::poll_readable;

const READ_CHUNK: usize = 8192;

/// Buffered, message-oriented end of the channel.
#[derive(Debug)]
pub struct Channel {
    reader: File,
    writer: File,
    buffer: MessageBuffer,
    closed: bool,
}

/// The far ends of a freshly created channel, to be handed to another
/// process.
///
/// Both descriptors are close-on-exec; the spawner clears the flag in the
/// child only.
#[derive(Debug)]
pub struct PeerFds {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl PeerFds {
    /// Raw descriptor numbers, as passed on the command line.
    pub fn raw(&self) -> (RawFd, RawFd) {
        (self.read.as_raw_fd(), self.write.as_raw_fd())
    }

    /// Use the far ends in this process.
    pub fn into_channel(self) -> Result<Channel, SupervisorError> {
        Channel::from_owned(self.read, self.write)
    }
}

/// Create a connected channel. Returns the local end and the peer's
/// descriptors.
pub fn pair() -> Result<(Channel, PeerFds), SupervisorError> {
    // local write -> peer read
    let (peer_read, local_write) = pipe2(OFlag::O_CLOEXEC)?;
    // peer write -> local read
    let (local_read, peer_write) = pipe2(OFlag::O_CLOEXEC)?;

    let channel = Channel::from_owned(local_read, local_write)?;
    Ok((
        channel,
        PeerFds {
            read: peer_read,
            write: peer_write,
        },
    ))
}

impl Channel {
    /// Wrap descriptors this process owns.
    pub fn from_owned(read: OwnedFd, write: OwnedFd) -> Result<Self, SupervisorError> {
        set_flags(&read, true)?;
        set_flags(&write, false)?;
        Ok(Self {
            reader: File::from(read),
            writer: File::from(write),
            buffer: MessageBuffer::new(),
            closed: false,
        })
    }

    /// Take ownership of inherited descriptors.
    ///
    /// # Safety
    ///
    /// Both descriptors must be open, distinct and not owned by anything else
    /// in this process.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Result<Self, SupervisorError> {
        if read < 0 || write < 0 || read == write {
            return Err(SupervisorError::InvalidConfig(format!(
                "invalid channel descriptors: read={} write={}",
                read, write
            )));
        }
        Self::from_owned(OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write))
    }

    /// Descriptor that becomes readable when data or EOF arrives.
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Write one message.
    pub fn send(&mut self, msg: &Message) -> Result<(), SupervisorError> {
        let bytes = encode(msg)?;
        match self.writer.write_all(&bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(SupervisorError::PeerGone),
            Err(e) => Err(e.into()),
        }
    }

    /// Move everything currently readable into the buffer.
    ///
    /// Never blocks. Returns the number of bytes read; EOF is remembered and
    /// surfaces from `try_recv` once the buffer is drained.
    pub fn fill(&mut self) -> Result<usize, SupervisorError> {
        if self.closed {
            return Ok(0);
        }

        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.buffer.extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Pop the next buffered message.
    ///
    /// `Ok(None)` means nothing complete is buffered yet. Once the peer has
    /// closed and the buffer is drained this returns `PeerGone`.
    pub fn try_recv(&mut self) -> Result<Option<Message>, SupervisorError> {
        if let Some(msg) = self.buffer.next_message()? {
            return Ok(Some(msg));
        }
        if self.closed {
            if !self.buffer.is_empty() {
                return Err(ProtoError::MalformedMessage(
                    "stream ended inside a message".to_string(),
                )
                .into());
            }
            return Err(SupervisorError::PeerGone);
        }
        Ok(None)
    }

    /// Block until a message arrives or `timeout` passes.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::Timeout(timeout));
            }

            poll_readable(&[self.read_fd()], deadline - now)?;
            self.fill()?;
        }
    }

    /// Returns true if `try_recv` would make progress without reading.
    pub fn has_buffered(&self) -> bool {
        self.closed || self.buffer.has_complete()
    }
}

fn set_flags(fd: &OwnedFd, nonblocking: bool) -> Result<(), SupervisorError> {
    let raw = fd.as_raw_fd();
    fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    let mut flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(raw, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
