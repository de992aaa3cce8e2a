//! In-memory remote host for transfer and session tests.
//!
//! The fake keeps a tiny filesystem, refuses the login user anything below
//! a denied directory, and interprets the handful of shell commands the
//! transfer engine issues. Every command and every transfer-channel open is
//! recorded.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use remote_exec::transport::{
    CommandChannel, Connection, RemoteStat, TransferHandle, S_IFDIR, S_IFREG,
};

pub const LOGIN: &str = "tester";

#[derive(Debug, Clone)]
pub enum Entry {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32, owner: String },
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    denied: Vec<String>,
    commands: Vec<String>,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn denied() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")
}

/// Outcome of a shell `[ ... ]` test.
fn test_result(holds: bool) -> (i32, String, String) {
    (i32::from(!holds), String::new(), String::new())
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such file")
}

impl State {
    fn is_denied(&self, path: &str) -> bool {
        self.denied.iter().any(|dir| {
            path.strip_prefix(dir.as_str())
                .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
        })
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.entries.get(path), Some(Entry::Dir { .. }))
    }

    fn is_file(&self, path: &str) -> bool {
        matches!(self.entries.get(path), Some(Entry::File { .. }))
    }

    fn write_file(&mut self, path: &str, data: Vec<u8>, owner: &str) -> io::Result<()> {
        if !self.is_dir(parent(path)) {
            return Err(not_found());
        }
        let mode = match self.entries.get(path) {
            Some(Entry::File { mode, .. }) => *mode,
            Some(Entry::Dir { .. }) => {
                return Err(io::Error::new(io::ErrorKind::Other, "is a directory"))
            }
            None => 0o644,
        };
        self.entries.insert(
            path.to_string(),
            Entry::File {
                data,
                mode,
                owner: owner.to_string(),
            },
        );
        Ok(())
    }

    /// Resolve a `mv`/`cp` destination the way coreutils does.
    fn destination(&self, src: &str, dst: &str) -> String {
        if self.is_dir(dst) {
            join(dst, basename(src))
        } else {
            dst.to_string()
        }
    }

    fn exec(&mut self, command: &str) -> (i32, String, String) {
        self.commands.push(command.to_string());
        let mut command = command;

        // Drop a duration wrapper.
        if let Some(rest) = command.strip_prefix("timeout ") {
            command = rest.split_once(' ').map(|(_, c)| c).unwrap_or("");
        }

        if command == "whoami" {
            return (0, format!("{LOGIN}\n"), String::new());
        }

        if let Some((check, chown)) = command.split_once(" && ") {
            let (code, _, err) = self.exec_elevated(check);
            if code != 0 {
                return (code, String::new(), err);
            }
            return self.exec_elevated(chown);
        }
        self.exec_elevated(command)
    }

    fn exec_elevated(&mut self, command: &str) -> (i32, String, String) {
        let Some(command) = command.strip_prefix("sudo ") else {
            return (127, String::new(), format!("sh: {command}: not found\n"));
        };
        let words: Vec<&str> = command.split(' ').collect();
        let ok = (0, String::new(), String::new());
        let fail = |msg: String| (1, String::new(), msg);

        match words.as_slice() {
            ["[", "-d", path, "]"] => test_result(self.is_dir(path)),
            ["[", "-f", path, "]"] => test_result(self.is_file(path)),
            ["mv", src, dst] => {
                let dst = self.destination(src, dst);
                match self.entries.remove(*src) {
                    Some(entry) if self.is_dir(parent(&dst)) => {
                        self.entries.insert(dst, entry);
                        ok
                    }
                    Some(entry) => {
                        self.entries.insert(src.to_string(), entry);
                        fail(format!("mv: cannot move '{src}' to '{dst}'\n"))
                    }
                    None => fail(format!("mv: cannot stat '{src}'\n")),
                }
            }
            ["cp", src, dst] => {
                let dst = self.destination(src, dst);
                match self.entries.get(*src).cloned() {
                    Some(Entry::File { data, mode, .. }) => {
                        self.entries.insert(
                            dst,
                            Entry::File {
                                data,
                                mode,
                                owner: "root".to_string(),
                            },
                        );
                        ok
                    }
                    _ => fail(format!("cp: cannot stat '{src}'\n")),
                }
            }
            ["chmod", mode, path] => {
                let Ok(new_mode) = u32::from_str_radix(mode, 8) else {
                    return fail(format!("chmod: invalid mode: '{mode}'\n"));
                };
                match self.entries.get_mut(*path) {
                    Some(Entry::File { mode, .. }) | Some(Entry::Dir { mode }) => {
                        *mode = new_mode;
                        ok
                    }
                    None => fail(format!("chmod: cannot access '{path}'\n")),
                }
            }
            ["chown", spec, path] => {
                let user = spec.split(':').next().unwrap_or("");
                match self.entries.get_mut(*path) {
                    Some(Entry::File { owner, .. }) => {
                        *owner = user.to_string();
                        ok
                    }
                    _ => fail(format!("chown: cannot access '{path}'\n")),
                }
            }
            ["stat", path] => match self.entries.get(*path) {
                Some(Entry::File { data, mode, .. }) => (
                    0,
                    format!(
                        "  File: {path}\n  Size: {}\t\tBlocks: 8\n\
                         Access: ({mode:04o}/-?????????)  Uid: (    0/    root)   Gid: (    0/    root)\n\
                         Access: 2024-01-01 00:00:00.000000000 +0000\n",
                        data.len()
                    ),
                    String::new(),
                ),
                _ => fail(format!("stat: cannot statx '{path}'\n")),
            },
            ["rm", "-f", path] => {
                self.entries.remove(*path);
                ok
            }
            _ => (127, String::new(), format!("sudo: {command}: command not found\n")),
        }
    }
}

/// Shared view of the fake host, kept by the test after the connection
/// has been handed to a session.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
    channels_opened: Arc<AtomicUsize>,
    transfers_opened: Arc<AtomicUsize>,
}

impl FakeRemote {
    /// A host with `/`, `/tmp`, `/srv` and a denied `/root`.
    pub fn new() -> Self {
        let remote = Self::default();
        remote.mkdir("/");
        remote.mkdir("/tmp");
        remote.mkdir("/srv");
        remote.mkdir("/root");
        remote.deny("/root");
        remote
    }

    pub fn mkdir(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(path.to_string(), Entry::Dir { mode: 0o755 });
    }

    pub fn deny(&self, dir: &str) {
        self.state.lock().unwrap().denied.push(dir.to_string());
    }

    pub fn add_file(&self, path: &str, data: &[u8], mode: u32) {
        self.state.lock().unwrap().entries.insert(
            path.to_string(),
            Entry::File {
                data: data.to_vec(),
                mode,
                owner: "root".to_string(),
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<(Vec<u8>, u32, String)> {
        match self.state.lock().unwrap().entries.get(path) {
            Some(Entry::File { data, mode, owner }) => Some((data.clone(), *mode, owner.clone())),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn transfers_opened(&self) -> usize {
        self.transfers_opened.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> FakeConnection {
        FakeConnection {
            remote: self.clone(),
        }
    }
}

pub struct FakeConnection {
    remote: FakeRemote,
}

impl Connection for FakeConnection {
    fn open_command_channel(
        &self,
        command: &str,
        _environment: &HashMap<String, String>,
        _options: &HashMap<String, String>,
    ) -> io::Result<Box<dyn CommandChannel>> {
        self.remote.channels_opened.fetch_add(1, Ordering::SeqCst);
        let (code, stdout, stderr) = self.remote.state.lock().unwrap().exec(command);
        // The peer is dropped, so the descriptor reports hang-up at once.
        let (fd, _peer) = UnixStream::pair()?;
        Ok(Box::new(FinishedChannel {
            fd,
            code,
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
        }))
    }

    fn open_transfer_channel(&self) -> io::Result<Arc<dyn TransferHandle>> {
        self.remote.transfers_opened.fetch_add(1, Ordering::SeqCst);
        // Widen the window for racing first accesses.
        thread::sleep(Duration::from_millis(20));
        Ok(Arc::new(FakeTransfer {
            state: Arc::clone(&self.remote.state),
        }))
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A command that completed before the channel was handed out.
struct FinishedChannel {
    fd: UnixStream,
    code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl AsFd for FinishedChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl CommandChannel for FinishedChannel {
    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_closed(&mut self) -> bool {
        true
    }

    fn stdout_ready(&mut self) -> io::Result<bool> {
        Ok(!self.stdout.is_empty())
    }

    fn stderr_ready(&mut self) -> io::Result<bool> {
        Ok(!self.stderr.is_empty())
    }

    fn recv_stdout(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.stdout.len();
        buf.append(&mut self.stdout);
        Ok(n)
    }

    fn recv_stderr(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.stderr.len();
        buf.append(&mut self.stderr);
        Ok(n)
    }

    fn exit_status_ready(&mut self) -> bool {
        true
    }

    fn exit_status(&mut self) -> io::Result<i32> {
        Ok(self.code)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// SFTP stand-in acting as the login user.
struct FakeTransfer {
    state: Arc<Mutex<State>>,
}

impl FakeTransfer {
    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned"))
    }
}

impl TransferHandle for FakeTransfer {
    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        let state = self.lock()?;
        if state.is_denied(path) {
            return Err(denied());
        }
        match state.entries.get(path) {
            Some(Entry::Dir { mode }) => Ok(RemoteStat::new(S_IFDIR | mode)),
            Some(Entry::File { mode, .. }) => Ok(RemoteStat::new(S_IFREG | mode)),
            None => Err(not_found()),
        }
    }

    fn get(&self, remote: &str, local: &Path) -> io::Result<()> {
        let state = self.lock()?;
        if state.is_denied(remote) {
            return Err(denied());
        }
        match state.entries.get(remote) {
            Some(Entry::File { data, owner, .. })
                if owner == LOGIN || !remote.starts_with("/tmp/") =>
            {
                fs::write(local, data)
            }
            Some(Entry::File { .. }) => Err(denied()),
            _ => Err(not_found()),
        }
    }

    fn put(&self, local: &Path, remote: &str) -> io::Result<()> {
        let data = fs::read(local)?;
        let mut state = self.lock()?;
        if state.is_denied(remote) {
            return Err(denied());
        }
        state.write_file(remote, data, LOGIN)
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.is_denied(path) {
            return Err(denied());
        }
        match state.entries.get_mut(path) {
            Some(Entry::File { mode: current, .. }) | Some(Entry::Dir { mode: current }) => {
                *current = mode;
                Ok(())
            }
            None => Err(not_found()),
        }
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let mut state = self.lock()?;
        if state.is_denied(path) {
            return Err(denied());
        }
        match state.entries.remove(path) {
            Some(_) => Ok(()),
            None => Err(not_found()),
        }
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
