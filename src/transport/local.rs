//! Local backend: commands run under `sh -c`, "remote" paths are local paths.
//!
//! Each channel owns three helper threads (stdout reader, stderr reader,
//! exit waiter). They append into shared buffers and poke a socket pair, so
//! the channel exposes a single descriptor that turns readable whenever
//! something changed.
//!
//! The only channel option is [`OPTION_CWD`], the working directory.

use std::collections::HashMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use rustix::io::Errno;
use rustix::process::{kill_process, waitid, Pid, Signal, WaitId, WaitIdOptions};
use tracing::{debug, trace};

use super::{CommandChannel, Connection, RemoteStat, TransferHandle};

/// Channel option naming the working directory of the command.
pub const OPTION_CWD: &str = "cwd";

/// Default buffer size for reading pipe output.
const READ_BUFFER_SIZE: usize = 8192;

/// Connection to the local machine.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    shell: PathBuf,
}

impl LocalConnection {
    /// Create a connection that runs commands with `/bin/sh`.
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    /// Use a different POSIX shell.
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for LocalConnection {
    fn open_command_channel(
        &self,
        command: &str,
        environment: &HashMap<String, String>,
        options: &HashMap<String, String>,
    ) -> io::Result<Box<dyn CommandChannel>> {
        let mut process = std::process::Command::new(&self.shell);
        process
            .arg("-c")
            .arg(command)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in options {
            match key.as_str() {
                OPTION_CWD => {
                    process.current_dir(value);
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsupported channel option {key:?}"),
                    ))
                }
            }
        }
        let child = process.spawn()?;
        debug!(pid = child.id(), "spawned local command");
        Ok(Box::new(LocalChannel::spawn(child)?))
    }

    fn open_transfer_channel(&self) -> io::Result<Arc<dyn TransferHandle>> {
        Ok(Arc::new(LocalTransfer::new()))
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Streams {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_eof: bool,
    stderr_eof: bool,
    /// Set by the waiter in the same critical section that reaps the child.
    exit: Option<i32>,
}

impl Streams {
    fn buffer(&mut self, stream: Stream) -> &mut Vec<u8> {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn mark_eof(&mut self, stream: Stream) {
        match stream {
            Stream::Stdout => self.stdout_eof = true,
            Stream::Stderr => self.stderr_eof = true,
        }
    }
}

/// A running local subprocess.
pub struct LocalChannel {
    shared: Arc<Mutex<Streams>>,
    notify: UnixStream,
    pid: Pid,
    read_shut: bool,
}

impl LocalChannel {
    fn spawn(mut child: Child) -> io::Result<Self> {
        let (notify, notifier) = UnixStream::pair()?;
        notify.set_nonblocking(true)?;
        notifier.set_nonblocking(true)?;

        let shared = Arc::new(Mutex::new(Streams::default()));
        let pid = Pid::from_child(&child);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stderr not piped"))?;

        spawn_reader(stdout, Stream::Stdout, Arc::clone(&shared), notifier.try_clone()?)?;
        spawn_reader(stderr, Stream::Stderr, Arc::clone(&shared), notifier.try_clone()?)?;
        spawn_waiter(child, Arc::clone(&shared), notifier)?;

        Ok(Self {
            shared,
            notify,
            pid,
            read_shut: false,
        })
    }

    fn streams(&self) -> io::Result<MutexGuard<'_, Streams>> {
        self.shared
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "channel state lock poisoned"))
    }

    /// Consume pending wake-up bytes so the descriptor stops reporting
    /// readiness for changes already seen.
    fn drain_notifications(&self) {
        let mut buf = [0u8; 64];
        let mut notify = &self.notify;
        loop {
            match notify.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn recv(&mut self, stream: Stream, buf: &mut Vec<u8>) -> io::Result<usize> {
        if self.read_shut {
            return Ok(0);
        }
        self.drain_notifications();
        let mut streams = self.streams()?;
        let pending = streams.buffer(stream);
        let n = pending.len();
        buf.append(pending);
        Ok(n)
    }
}

impl AsFd for LocalChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.notify.as_fd()
    }
}

impl CommandChannel for LocalChannel {
    fn shutdown_write(&mut self) -> io::Result<()> {
        // stdin is /dev/null from the start.
        Ok(())
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        self.read_shut = true;
        Ok(())
    }

    fn is_closed(&mut self) -> bool {
        self.streams()
            .map(|s| s.stdout_eof && s.stderr_eof)
            .unwrap_or(true)
    }

    fn stdout_ready(&mut self) -> io::Result<bool> {
        Ok(!self.streams()?.stdout.is_empty())
    }

    fn stderr_ready(&mut self) -> io::Result<bool> {
        Ok(!self.streams()?.stderr.is_empty())
    }

    fn recv_stdout(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.recv(Stream::Stdout, buf)
    }

    fn recv_stderr(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.recv(Stream::Stderr, buf)
    }

    fn exit_status_ready(&mut self) -> bool {
        self.streams().map(|s| s.exit.is_some()).unwrap_or(false)
    }

    fn exit_status(&mut self) -> io::Result<i32> {
        self.streams()?
            .exit
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "exit status not yet available"))
    }

    fn close(&mut self) -> io::Result<()> {
        // Holding the lock keeps the waiter from reaping, so the pid still
        // names our child while `exit` is unset.
        let streams = self.streams()?;
        if streams.exit.is_none() {
            debug!(pid = ?self.pid, "killing unfinished local command");
            match kill_process(self.pid, Signal::KILL) {
                Ok(()) | Err(Errno::SRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn signal(notifier: &UnixStream) {
    let mut notifier = notifier;
    // A full socket already holds a pending wake-up.
    let _ = notifier.write(&[1]);
}

fn spawn_reader<R>(
    mut reader: R,
    stream: Stream,
    shared: Arc<Mutex<Streams>>,
    notifier: UnixStream,
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("local-{stream:?}").to_lowercase())
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(?stream, bytes = n, "pipe read");
                        if let Ok(mut streams) = shared.lock() {
                            streams.buffer(stream).extend_from_slice(&buf[..n]);
                        }
                        signal(&notifier);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(?stream, "pipe read failed: {e}");
                        break;
                    }
                }
            }
            if let Ok(mut streams) = shared.lock() {
                streams.mark_eof(stream);
            }
            signal(&notifier);
        })?;
    Ok(())
}

fn spawn_waiter(
    mut child: Child,
    shared: Arc<Mutex<Streams>>,
    notifier: UnixStream,
) -> io::Result<()> {
    thread::Builder::new()
        .name("local-wait".to_string())
        .spawn(move || {
            // Wait for the exit without reaping, then reap under the lock.
            let pid = Pid::from_child(&child);
            loop {
                match waitid(WaitId::Pid(pid), WaitIdOptions::EXITED | WaitIdOptions::NOWAIT) {
                    Err(Errno::INTR) => continue,
                    Err(e) => debug!("waitid on child failed: {e}"),
                    Ok(_) => {}
                }
                break;
            }
            let reap = |child: &mut Child| match child.wait() {
                Ok(status) => exit_code(status),
                Err(e) => {
                    debug!("waiting for child failed: {e}");
                    -1
                }
            };
            match shared.lock() {
                Ok(mut streams) => streams.exit = Some(reap(&mut child)),
                Err(_) => {
                    reap(&mut child);
                }
            }
            signal(&notifier);
        })?;
    Ok(())
}

/// Shell convention: a signal-terminated process reports `128 + signo`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Local filesystem standing in for a file-transfer sub-channel.
#[derive(Debug, Default)]
pub struct LocalTransfer {
    closed: AtomicBool,
}

impl LocalTransfer {
    /// Create an open handle.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transfer handle closed",
            ));
        }
        Ok(())
    }
}

/// Copy bytes only; the destination keeps its own (or default) mode.
fn copy_contents(from: &Path, to: &Path) -> io::Result<()> {
    let mut src = File::open(from)?;
    let mut dst = File::create(to)?;
    io::copy(&mut src, &mut dst)?;
    dst.flush()
}

impl TransferHandle for LocalTransfer {
    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        self.ensure_open()?;
        Ok(RemoteStat::new(fs::metadata(path)?.mode()))
    }

    fn get(&self, remote: &str, local: &Path) -> io::Result<()> {
        self.ensure_open()?;
        copy_contents(Path::new(remote), local)
    }

    fn put(&self, local: &Path, remote: &str) -> io::Result<()> {
        self.ensure_open()?;
        copy_contents(local, Path::new(remote))
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        self.ensure_open()?;
        fs::set_permissions(path, Permissions::from_mode(mode))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.ensure_open()?;
        fs::remove_file(path)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
