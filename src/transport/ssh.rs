//! SSH backend built on libssh2.
//!
//! The libssh2 session is switched to non-blocking mode once authenticated,
//! so command channels never stall the multiplexer. Every libssh2 call that
//! reports `EAGAIN` waits on the socket in the directions libssh2 asks for and
//! is then reissued; that wait is bounded by [`SshConfig::io_timeout`].
//!
//! All channels share one socket, and any libssh2 read may queue packets
//! for a channel other than the caller's. Each channel therefore also owns a
//! wake-up socket that a reader signals after pulling input off the wire.
//!
//! The only channel option is [`OPTION_PTY`], the terminal type of a
//! pseudo-terminal requested before `exec`.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags, Timespec};
use rustix::io::Errno;
use ssh2::{BlockDirections, ErrorCode, FileStat, HashType, Session, Sftp};
use tracing::{debug, info, trace};

use super::{CommandChannel, Connection, RemoteStat, TransferHandle};
use crate::error::RemoteExecError;
use crate::Result;

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

/// Default buffer size for channel and file reads.
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Channel option requesting a pseudo-terminal of the given type.
pub const OPTION_PTY: &str = "pty";

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default bound on a single wait for socket readiness.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Private key algorithm tags accepted for in-memory keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// DSA (also accepted as `DSS`).
    Dsa,
    /// RSA.
    Rsa,
    /// ECDSA.
    Ecdsa,
    /// Ed25519.
    Ed25519,
}

impl FromStr for KeyAlgorithm {
    type Err = RemoteExecError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "DSA" | "DSS" => Ok(Self::Dsa),
            "RSA" => Ok(Self::Rsa),
            "ECDSA" => Ok(Self::Ecdsa),
            "ED25519" => Ok(Self::Ed25519),
            _ => Err(RemoteExecError::InvalidArgument(format!(
                "unsupported key algorithm {tag:?}"
            ))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dsa => "DSA",
            Self::Rsa => "RSA",
            Self::Ecdsa => "ECDSA",
            Self::Ed25519 => "ED25519",
        };
        f.write_str(name)
    }
}

/// How to authenticate.
#[derive(Clone)]
pub enum SshAuth {
    /// Password authentication.
    Password(String),
    /// Private key read from a file.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Private key given as PEM text.
    KeyText {
        text: String,
        algorithm: KeyAlgorithm,
        passphrase: Option<String>,
    },
    /// Keys offered by a running SSH agent.
    Agent,
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
            Self::KeyText { algorithm, .. } => f
                .debug_struct("KeyText")
                .field("algorithm", algorithm)
                .finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Settings for [`SshConnection::connect`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Authentication method.
    pub auth: SshAuth,
    /// TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Bound on any single wait for socket readiness.
    pub io_timeout: Duration,
    /// Expected SHA-256 host key fingerprint (lowercase hex). Unknown keys
    /// are accepted when unset.
    pub host_key_sha256: Option<String>,
}

impl SshConfig {
    /// Create a config for `username@host` on the default port.
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            auth,
            connect_timeout: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
            host_key_sha256: None,
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

fn map_ssh_error(err: ssh2::Error) -> io::Error {
    let kind = match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => io::ErrorKind::WouldBlock,
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => io::ErrorKind::TimedOut,
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH) => {
            io::ErrorKind::NotFound
        }
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

fn is_again(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Wake-up sockets of the channels open on one session.
#[derive(Debug, Default)]
struct Wakers {
    next_id: AtomicU64,
    peers: Mutex<Vec<(u64, UnixStream)>>,
}

impl Wakers {
    /// Add a channel; returns its id and the end it polls.
    fn register(&self) -> io::Result<(u64, UnixStream)> {
        let (notify, notifier) = UnixStream::pair()?;
        notify.set_nonblocking(true)?;
        notifier.set_nonblocking(true)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "waker lock poisoned"))?
            .push((id, notifier));
        Ok((id, notify))
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.retain(|(peer, _)| *peer != id);
        }
    }

    /// Signal every channel except `origin`.
    fn wake_others(&self, origin: u64) {
        if let Ok(peers) = self.peers.lock() {
            for (_, notifier) in peers.iter().filter(|(peer, _)| *peer != origin) {
                // A full socket already holds a pending wake-up.
                let _ = (&*notifier).write(&[1]);
            }
        }
    }
}

/// Drives non-blocking libssh2 calls to completion.
#[derive(Clone)]
struct Io {
    session: Session,
    socket: Arc<TcpStream>,
    timeout: Duration,
    wakers: Arc<Wakers>,
}

impl Io {
    /// Poll the socket once for `events`; `true` if any became ready.
    fn poll(&self, events: PollFlags, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(&*self.socket, events)];
        let timeout = Timespec::try_from(timeout).unwrap_or(Timespec {
            tv_sec: rustix::event::Secs::MAX,
            tv_nsec: 0,
        });
        match rustix::event::poll(&mut fds, Some(&timeout)) {
            Ok(n) => Ok(n > 0),
            Err(Errno::INTR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Check, without waiting, if input is queued on the socket.
    fn socket_readable(&self) -> bool {
        self.poll(PollFlags::IN, Duration::ZERO).unwrap_or(false)
    }

    /// Block until the socket is ready in the directions libssh2 is waiting on.
    fn wait(&self) -> io::Result<()> {
        let events = match self.session.block_directions() {
            BlockDirections::Inbound => PollFlags::IN,
            BlockDirections::Outbound => PollFlags::OUT,
            BlockDirections::Both | BlockDirections::None => PollFlags::IN | PollFlags::OUT,
        };
        if self.poll(events, self.timeout)? {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("socket not ready after {:?}", self.timeout),
            ))
        }
    }

    /// Reissue `op` until it stops reporting `EAGAIN`.
    fn retry<T>(
        &self,
        mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
    ) -> io::Result<T> {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_again(&e) => self.wait()?,
                Err(e) => return Err(map_ssh_error(e)),
            }
        }
    }

    /// Like [`Io::retry`] for std I/O calls that report `WouldBlock`.
    fn retry_io<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.wait()?,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn copy(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<u64> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.retry_io(|| reader.read(&mut buf))?;
            if n == 0 {
                break;
            }
            let mut offset = 0;
            while offset < n {
                let written = self.retry_io(|| writer.write(&buf[offset..n]))?;
                if written == 0 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "remote write stalled"));
                }
                offset += written;
            }
            total += n as u64;
        }
        self.retry_io(|| writer.flush())?;
        Ok(total)
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    io: Io,
}

impl SshConnection {
    /// Connect and authenticate.
    pub fn connect(config: &SshConfig) -> Result<Self> {
        let connectivity =
            |what: &str, e: &dyn fmt::Display| {
                RemoteExecError::Connectivity(format!("{what}: {e}"))
            };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connectivity("failed to resolve host", &e))?
            .next()
            .ok_or_else(|| {
                RemoteExecError::Connectivity(format!("no address for host {}", config.host))
            })?;

        let tcp = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| connectivity("failed to connect", &e))?;
        let socket = tcp
            .try_clone()
            .map_err(|e| connectivity("failed to clone socket", &e))?;

        let mut session = Session::new().map_err(|e| connectivity("failed to create session", &e))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| connectivity("handshake failed", &e))?;

        let fingerprint = session.host_key_hash(HashType::Sha256).map(hex);
        debug!(host = %config.host, fingerprint = ?fingerprint, "host key received");
        if let Some(expected) = &config.host_key_sha256 {
            if fingerprint.as_deref() != Some(expected.to_ascii_lowercase().as_str()) {
                return Err(RemoteExecError::Connectivity(format!(
                    "host key mismatch for {} (expected {}, got {})",
                    config.host,
                    expected,
                    fingerprint.unwrap_or_else(|| "none".to_string())
                )));
            }
        }

        authenticate(&session, config).map_err(|e| connectivity("authentication failed", &e))?;
        if !session.authenticated() {
            return Err(RemoteExecError::Connectivity(format!(
                "authentication as {} was not accepted",
                config.username
            )));
        }
        info!(host = %config.host, port = config.port, user = %config.username, "connected");

        session.set_blocking(false);
        Ok(Self {
            io: Io {
                session,
                socket: Arc::new(socket),
                timeout: config.io_timeout,
                wakers: Arc::new(Wakers::default()),
            },
        })
    }
}

fn authenticate(session: &Session, config: &SshConfig) -> std::result::Result<(), ssh2::Error> {
    let user = config.username.as_str();
    match &config.auth {
        SshAuth::Password(password) => session.userauth_password(user, password),
        SshAuth::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
        }
        SshAuth::KeyText {
            text,
            algorithm,
            passphrase,
        } => {
            debug!(%algorithm, "authenticating with in-memory key");
            session.userauth_pubkey_memory(user, None, text, passphrase.as_deref())
        }
        SshAuth::Agent => session.userauth_agent(user),
    }
}

impl Connection for SshConnection {
    fn open_command_channel(
        &self,
        command: &str,
        environment: &HashMap<String, String>,
        options: &HashMap<String, String>,
    ) -> io::Result<Box<dyn CommandChannel>> {
        let mut pty = None;
        for (key, value) in options {
            match key.as_str() {
                OPTION_PTY => pty = Some(value.as_str()),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsupported channel option {key:?}"),
                    ))
                }
            }
        }

        let mut channel = self.io.retry(|| self.io.session.channel_session())?;
        for (key, value) in environment {
            if let Err(e) = self.io.retry(|| channel.setenv(key, value)) {
                // Servers only accept variables listed in AcceptEnv.
                debug!(%key, "environment variable rejected: {e}");
            }
        }
        if let Some(term) = pty {
            self.io.retry(|| channel.request_pty(term, None, None))?;
        }
        self.io.retry(|| channel.exec(command))?;

        let (waker_id, notify) = self.io.wakers.register()?;
        Ok(Box::new(SshChannel {
            channel,
            io: self.io.clone(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_ready: false,
            waker_id,
            notify,
        }))
    }

    fn open_transfer_channel(&self) -> io::Result<Arc<dyn TransferHandle>> {
        let sftp = self.io.retry(|| self.io.session.sftp())?;
        Ok(Arc::new(SshTransfer {
            sftp: Mutex::new(Some(sftp)),
            io: self.io.clone(),
        }))
    }

    fn close(&self) -> io::Result<()> {
        self.io
            .retry(|| self.io.session.disconnect(None, "closing", None))
    }
}

/// One `exec` channel.
pub struct SshChannel {
    channel: ssh2::Channel,
    io: Io,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_ready: bool,
    waker_id: u64,
    notify: UnixStream,
}

impl SshChannel {
    /// Consume wake-ups already acted on.
    fn drain_notifications(&self) {
        let mut buf = [0u8; 64];
        let mut notify = &self.notify;
        while matches!(notify.read(&mut buf), Ok(n) if n > 0) {}
    }

    /// Pull everything libssh2 can hand over right now into the pending
    /// buffer of stream `id` (0 stdout, 1 stderr).
    ///
    /// If the socket had input, libssh2 may have queued packets of other
    /// channels while reading, so those are woken.
    fn fill(&mut self, id: i32) -> io::Result<()> {
        self.drain_notifications();
        let had_input = self.io.socket_readable();
        let result = self.read_stream(id);
        if had_input {
            trace!(channel = self.waker_id, "socket input consumed, waking peers");
            self.io.wakers.wake_others(self.waker_id);
        }
        result
    }

    fn read_stream(&mut self, id: i32) -> io::Result<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut stream = self.channel.stream(id);
        let pending = if id == 0 {
            &mut self.stdout
        } else {
            &mut self.stderr
        };
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for SshChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.socket.as_fd()
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.io.wakers.unregister(self.waker_id);
    }
}

impl CommandChannel for SshChannel {
    fn wake_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.notify.as_fd())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        let io = self.io.clone();
        io.retry(|| self.channel.send_eof())
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        // libssh2 has no read half-close; the channel close covers it.
        Ok(())
    }

    fn is_closed(&mut self) -> bool {
        self.channel.eof()
    }

    fn stdout_ready(&mut self) -> io::Result<bool> {
        self.fill(0)?;
        Ok(!self.stdout.is_empty())
    }

    fn stderr_ready(&mut self) -> io::Result<bool> {
        self.fill(1)?;
        Ok(!self.stderr.is_empty())
    }

    fn recv_stdout(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.fill(0)?;
        let n = self.stdout.len();
        buf.append(&mut self.stdout);
        Ok(n)
    }

    fn recv_stderr(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.fill(1)?;
        let n = self.stderr.len();
        buf.append(&mut self.stderr);
        Ok(n)
    }

    fn exit_status_ready(&mut self) -> bool {
        if !self.exit_ready && self.channel.eof() {
            // The status arrives before the remote close.
            self.exit_ready = self.channel.wait_close().is_ok();
        }
        self.exit_ready
    }

    fn exit_status(&mut self) -> io::Result<i32> {
        self.channel.exit_status().map_err(map_ssh_error)
    }

    fn close(&mut self) -> io::Result<()> {
        let io = self.io.clone();
        io.retry(|| self.channel.close())
    }
}

/// SFTP sub-channel shared by every transfer of a session.
pub struct SshTransfer {
    sftp: Mutex<Option<Sftp>>,
    io: Io,
}

impl SshTransfer {
    fn sftp(&self) -> io::Result<MutexGuard<'_, Option<Sftp>>> {
        let guard = self
            .sftp
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sftp lock poisoned"))?;
        if guard.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "sftp channel closed"));
        }
        Ok(guard)
    }
}

/// Borrow the SFTP client out of a guard checked by [`SshTransfer::sftp`].
fn client<'a>(guard: &'a MutexGuard<'_, Option<Sftp>>) -> io::Result<&'a Sftp> {
    guard
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sftp channel closed"))
}

impl TransferHandle for SshTransfer {
    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        let guard = self.sftp()?;
        let sftp = client(&guard)?;
        let stat = self.io.retry(|| sftp.stat(Path::new(path)))?;
        Ok(RemoteStat::new(stat.perm.unwrap_or(0)))
    }

    fn get(&self, remote: &str, local: &Path) -> io::Result<()> {
        let guard = self.sftp()?;
        let sftp = client(&guard)?;
        let mut src = self.io.retry(|| sftp.open(Path::new(remote)))?;
        let mut dst = std::fs::File::create(local)?;
        let copied = self.io.copy(&mut src, &mut dst)?;
        self.io.retry(|| src.close())?;
        debug!(remote, bytes = copied, "sftp get complete");
        Ok(())
    }

    fn put(&self, local: &Path, remote: &str) -> io::Result<()> {
        let mut src = std::fs::File::open(local)?;
        let guard = self.sftp()?;
        let sftp = client(&guard)?;
        let mut dst = self.io.retry(|| sftp.create(Path::new(remote)))?;
        let copied = self.io.copy(&mut src, &mut dst)?;
        self.io.retry(|| dst.close())?;
        debug!(remote, bytes = copied, "sftp put complete");
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let guard = self.sftp()?;
        let sftp = client(&guard)?;
        self.io.retry(|| {
            sftp.setstat(
                Path::new(path),
                FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(mode),
                    atime: None,
                    mtime: None,
                },
            )
        })
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let guard = self.sftp()?;
        let sftp = client(&guard)?;
        self.io.retry(|| sftp.unlink(Path::new(path)))
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self
            .sftp
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sftp lock poisoned"))?;
        // Dropping the client releases the subsystem channel.
        guard.take();
        Ok(())
    }
}
