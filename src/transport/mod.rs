//! Transport abstraction layer.
//!
//! The execution and transfer engines only see three narrow traits: a
//! [`Connection`] that opens one [`CommandChannel`] per command and hands out
//! a [`TransferHandle`] for file operations. Two backends are provided:
//!
//! - [`ssh::SshConnection`]: libssh2 over TCP
//! - [`local::LocalConnection`]: `sh -c` subprocesses and the local filesystem

pub mod local;
pub mod ssh;

pub use local::LocalConnection;
pub use ssh::{KeyAlgorithm, SshAuth, SshConfig, SshConnection};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;

/// File type bits of `st_mode`.
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;

/// Metadata returned by [`TransferHandle::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    /// Raw `st_mode`, type bits included.
    pub mode: u32,
}

impl RemoteStat {
    /// Create a stat record from a raw `st_mode`.
    pub fn new(mode: u32) -> Self {
        Self { mode }
    }

    /// Check if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Check if the entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits only (`S_IMODE`).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// An established, authenticated transport to one host.
pub trait Connection: Send + Sync {
    /// Start `command` on a fresh channel with the given environment.
    ///
    /// `options` are backend-specific channel settings. A backend rejects
    /// keys it does not understand with [`io::ErrorKind::InvalidInput`].
    fn open_command_channel(
        &self,
        command: &str,
        environment: &HashMap<String, String>,
        options: &HashMap<String, String>,
    ) -> io::Result<Box<dyn CommandChannel>>;

    /// Open the file-transfer sub-channel.
    ///
    /// Callers memoise the result; backends may create a new handle per call.
    fn open_transfer_channel(&self) -> io::Result<Arc<dyn TransferHandle>>;

    /// Tear down the transport.
    fn close(&self) -> io::Result<()>;
}

/// One running command with independent stdout and stderr streams.
///
/// The descriptor exposed through [`AsFd`], together with the optional
/// [`wake_fd`], becomes readable whenever new stdout, stderr or exit-status
/// data may be available. All `recv_*` calls are non-blocking.
///
/// [`wake_fd`]: CommandChannel::wake_fd
pub trait CommandChannel: AsFd + Send {
    /// A second descriptor signalled when data for this channel was pulled
    /// off the transport by someone else.
    fn wake_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Signal that no input will be sent.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Signal that no more output will be read.
    fn shutdown_read(&mut self) -> io::Result<()>;

    /// Check if the remote side has closed its output streams.
    fn is_closed(&mut self) -> bool;

    /// Check if stdout bytes can be read right now.
    fn stdout_ready(&mut self) -> io::Result<bool>;

    /// Check if stderr bytes can be read right now.
    fn stderr_ready(&mut self) -> io::Result<bool>;

    /// Append every stdout byte available right now to `buf`.
    ///
    /// Returns the number of bytes appended.
    fn recv_stdout(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// Append every stderr byte available right now to `buf`.
    fn recv_stderr(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// Check if the remote process has posted its exit status.
    fn exit_status_ready(&mut self) -> bool;

    /// The exit status. Only meaningful once [`exit_status_ready`] is true.
    ///
    /// [`exit_status_ready`]: CommandChannel::exit_status_ready
    fn exit_status(&mut self) -> io::Result<i32>;

    /// Release the channel.
    fn close(&mut self) -> io::Result<()>;
}

/// File-transfer sub-channel (SFTP or equivalent).
///
/// Implementations must be safe to share between threads. Errors use
/// [`io::ErrorKind::NotFound`] and [`io::ErrorKind::PermissionDenied`] for
/// absent paths and refused access.
pub trait TransferHandle: Send + Sync {
    /// Query metadata of `path`, following symlinks.
    fn stat(&self, path: &str) -> io::Result<RemoteStat>;

    /// Copy remote file `remote` into local file `local`.
    fn get(&self, remote: &str, local: &Path) -> io::Result<()>;

    /// Copy local file `local` into remote file `remote`.
    fn put(&self, local: &Path, remote: &str) -> io::Result<()>;

    /// Set the permission bits of `path`.
    fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Remove the file at `path`.
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Release the sub-channel.
    fn close(&self) -> io::Result<()>;
}
