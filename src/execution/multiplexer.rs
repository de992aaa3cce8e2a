//! Event-driven draining of a command channel's output streams.
//!
//! The [`Selector`] is a thin readiness primitive over `poll(2)`. The
//! [`StreamMultiplexer`] owns one selector plus the stdout/stderr
//! accumulation buffers and drives a channel until the remote process has
//! both exited and drained.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use rustix::event::{PollFd, PollFlags, Secs, Timespec};
use rustix::io::Errno;
use tracing::trace;

use crate::transport::CommandChannel;

/// Readiness notification over a set of registered descriptors.
///
/// Descriptors are only recorded on registration; each wait borrows the
/// ones to poll, and unregistered ones are skipped.
#[derive(Debug, Default)]
pub struct Selector {
    fds: Vec<RawFd>,
}

impl Selector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` for readability.
    pub fn register(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let fd = fd.as_raw_fd();
        if self.fds.contains(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }
        self.fds.push(fd);
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn unregister(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let fd = fd.as_raw_fd();
        let before = self.fds.len();
        self.fds.retain(|&registered| registered != fd);
        if self.fds.len() == before {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} is not registered"),
            ));
        }
        Ok(())
    }

    /// Check if `fd` is being watched.
    pub fn is_registered(&self, fd: BorrowedFd<'_>) -> bool {
        self.fds.contains(&fd.as_raw_fd())
    }

    /// Number of watched descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Check if nothing is being watched.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block for at most `timeout` and return those of `sources` that are
    /// registered and readable, hung up or in error.
    ///
    /// An interrupted wait returns an empty set.
    pub fn select(&self, sources: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<RawFd>> {
        let mut pollfds: Vec<PollFd<'_>> = sources
            .iter()
            .filter(|fd| self.fds.contains(&fd.as_raw_fd()))
            .map(|&fd| PollFd::from_borrowed_fd(fd, PollFlags::IN))
            .collect();

        match rustix::event::poll(&mut pollfds, Some(&poll_timeout(timeout))) {
            Ok(_) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let ready_mask = PollFlags::IN | PollFlags::HUP | PollFlags::ERR;
        Ok(pollfds
            .iter()
            .filter(|p| p.revents().intersects(ready_mask))
            .map(|p| p.as_fd().as_raw_fd())
            .collect())
    }
}

/// Convert a wait budget to a `poll` timeout, saturating budgets the
/// kernel cannot represent.
fn poll_timeout(timeout: Duration) -> Timespec {
    Timespec::try_from(timeout).unwrap_or(Timespec {
        tv_sec: Secs::MAX,
        tv_nsec: 0,
    })
}

/// How a call to [`StreamMultiplexer::drain`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The process exited and both streams are drained.
    Finished,
    /// The caller's deadline passed first.
    DeadlineElapsed,
}

/// Accumulates a channel's stdout and stderr without blocking indefinitely.
#[derive(Debug, Default)]
pub struct StreamMultiplexer {
    selector: Selector,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl StreamMultiplexer {
    /// Create a multiplexer with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the channel's descriptors for readability.
    pub fn register(&mut self, channel: &dyn CommandChannel) -> io::Result<()> {
        self.selector.register(channel.as_fd())?;
        if let Some(wake) = channel.wake_fd() {
            if let Err(e) = self.selector.register(wake) {
                self.selector.unregister(channel.as_fd())?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unregister the channel's descriptors.
    pub fn unregister(&mut self, channel: &dyn CommandChannel) -> io::Result<()> {
        let primary = self.selector.unregister(channel.as_fd());
        if let Some(wake) = channel.wake_fd() {
            self.selector.unregister(wake)?;
        }
        primary
    }

    /// Check if the channel is currently registered.
    pub fn is_registered(&self, channel: &dyn CommandChannel) -> bool {
        self.selector.is_registered(channel.as_fd())
    }

    /// Append whatever stdout, then stderr, bytes the channel has right now.
    pub fn capture_pending(&mut self, channel: &mut dyn CommandChannel) -> io::Result<()> {
        let out = channel.recv_stdout(&mut self.stdout)?;
        let err = channel.recv_stderr(&mut self.stderr)?;
        if out > 0 || err > 0 {
            trace!(stdout = out, stderr = err, "captured channel output");
        }
        Ok(())
    }

    /// Drive `channel` until its process has exited and both streams are
    /// empty, or until `deadline` passes.
    ///
    /// Each wait on the selector is bounded by `wait_budget`; an expired
    /// budget only starts another iteration. On completion the read side of
    /// the channel is shut down.
    pub fn drain(
        &mut self,
        channel: &mut dyn CommandChannel,
        wait_budget: Duration,
        deadline: Option<Instant>,
    ) -> io::Result<DrainOutcome> {
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    wait_budget.min(deadline.saturating_duration_since(Instant::now()))
                }
                None => wait_budget,
            };

            let ready = {
                let mut sources = vec![channel.as_fd()];
                sources.extend(channel.wake_fd());
                self.selector.select(&sources, wait)?
            };
            if ready.is_empty() {
                trace!(?wait, "wait elapsed without readiness");
            }

            // Reading on every iteration, not only on wake-ups, picks up bytes
            // the transport buffered internally without a descriptor edge.
            self.capture_pending(channel)?;

            if Self::finished(channel)? {
                channel.shutdown_read()?;
                return Ok(DrainOutcome::Finished);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(DrainOutcome::DeadlineElapsed);
                }
            }
        }
    }

    fn finished(channel: &mut dyn CommandChannel) -> io::Result<bool> {
        Ok(channel.is_closed()
            && !channel.stdout_ready()?
            && !channel.stderr_ready()?
            && channel.exit_status_ready())
    }

    /// Bytes of stdout accumulated so far.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Bytes of stderr accumulated so far.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Move both buffers out, leaving them empty.
    pub fn take(&mut self) -> (Vec<u8>, Vec<u8>) {
        (
            std::mem::take(&mut self.stdout),
            std::mem::take(&mut self.stderr),
        )
    }

    /// Clear both buffers.
    pub fn reset(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
    }
}
