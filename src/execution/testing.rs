//! Scripted channel and connection used by the execution unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::transport::{CommandChannel, Connection, TransferHandle};

/// Flags observable after the channel has been handed to the code under test.
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    closed: AtomicBool,
    read_shut: AtomicBool,
    write_shut: AtomicBool,
}

impl ChannelState {
    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn read_shut_down(&self) -> bool {
        self.read_shut.load(Ordering::SeqCst)
    }

    pub(crate) fn write_shut_down(&self) -> bool {
        self.write_shut.load(Ordering::SeqCst)
    }
}

/// A channel that hands out one queued chunk per `recv_*` call.
///
/// Its descriptor is always readable.
pub(crate) struct ScriptedChannel {
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    exit_code: i32,
    exit_after_polls: usize,
    polls: usize,
    never_exits: bool,
    fail_exit_status: bool,
    state: Arc<ChannelState>,
    readable: UnixStream,
    _writer: UnixStream,
}

impl ScriptedChannel {
    pub(crate) fn new(exit_code: i32) -> Self {
        let (readable, mut writer) = UnixStream::pair().expect("socket pair");
        writer.write_all(b"!").expect("prime socket");
        Self {
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            exit_code,
            exit_after_polls: 0,
            polls: 0,
            never_exits: false,
            fail_exit_status: false,
            state: Arc::new(ChannelState::default()),
            readable,
            _writer: writer,
        }
    }

    pub(crate) fn stdout_chunks(mut self, chunks: &[&[u8]]) -> Self {
        self.stdout.extend(chunks.iter().map(|c| c.to_vec()));
        self
    }

    pub(crate) fn stderr_chunks(mut self, chunks: &[&[u8]]) -> Self {
        self.stderr.extend(chunks.iter().map(|c| c.to_vec()));
        self
    }

    pub(crate) fn exit_after_polls(mut self, polls: usize) -> Self {
        self.exit_after_polls = polls;
        self
    }

    pub(crate) fn never_exits(mut self) -> Self {
        self.never_exits = true;
        self
    }

    pub(crate) fn failing_exit_status(mut self) -> Self {
        self.fail_exit_status = true;
        self
    }

    pub(crate) fn state(&self) -> Arc<ChannelState> {
        Arc::clone(&self.state)
    }
}

impl AsFd for ScriptedChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.readable.as_fd()
    }
}

impl CommandChannel for ScriptedChannel {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.state.write_shut.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        self.state.read_shut.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&mut self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    fn stdout_ready(&mut self) -> io::Result<bool> {
        Ok(!self.stdout.is_empty())
    }

    fn stderr_ready(&mut self) -> io::Result<bool> {
        Ok(!self.stderr.is_empty())
    }

    fn recv_stdout(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        Ok(self.stdout.pop_front().map_or(0, |chunk| {
            buf.extend_from_slice(&chunk);
            chunk.len()
        }))
    }

    fn recv_stderr(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        Ok(self.stderr.pop_front().map_or(0, |chunk| {
            buf.extend_from_slice(&chunk);
            chunk.len()
        }))
    }

    fn exit_status_ready(&mut self) -> bool {
        self.polls += 1;
        !self.never_exits && self.polls >= self.exit_after_polls
    }

    fn exit_status(&mut self) -> io::Result<i32> {
        if self.fail_exit_status {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel dropped"));
        }
        Ok(self.exit_code)
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection that serves queued [`ScriptedChannel`]s and records what it
/// was asked to run.
///
/// Channel options outside the supported set are refused.
#[derive(Default)]
pub(crate) struct ScriptedConnection {
    channels: Mutex<VecDeque<ScriptedChannel>>,
    commands: Mutex<Vec<(String, HashMap<String, String>)>>,
    options: Mutex<Vec<HashMap<String, String>>>,
    supported: Vec<&'static str>,
    opened: AtomicUsize,
    refuse: bool,
}

impl ScriptedConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub(crate) fn supporting(mut self, keys: &[&'static str]) -> Self {
        self.supported.extend_from_slice(keys);
        self
    }

    pub(crate) fn push(&self, channel: ScriptedChannel) {
        self.channels.lock().unwrap().push_back(channel);
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<(String, HashMap<String, String>)> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn options(&self) -> Vec<HashMap<String, String>> {
        self.options.lock().unwrap().clone()
    }
}

impl Connection for ScriptedConnection {
    fn open_command_channel(
        &self,
        command: &str,
        environment: &HashMap<String, String>,
        options: &HashMap<String, String>,
    ) -> io::Result<Box<dyn CommandChannel>> {
        if self.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        }
        if let Some(key) = options
            .keys()
            .find(|key| !self.supported.iter().any(|known| known == key)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported channel option {key:?}"),
            ));
        }
        self.options.lock().unwrap().push(options.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .unwrap()
            .push((command.to_string(), environment.clone()));
        let channel = self
            .channels
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedChannel::new(0));
        Ok(Box::new(channel))
    }

    fn open_transfer_channel(&self) -> io::Result<Arc<dyn TransferHandle>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no transfer channel",
        ))
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
