//! Command execution engine.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::command::{CommandInvocation, DurationCap, DEFAULT_LANG};
use super::multiplexer::{DrainOutcome, StreamMultiplexer};
use super::result::ExecutionResult;
use crate::error::RemoteExecError;
use crate::transport::{CommandChannel, Connection};
use crate::Result;

/// Default per-wait ceiling for the multiplexer.
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(10);

/// Runs one command per call on a [`Connection`].
///
/// Nothing is retried: a command may have side effects, so it is issued at
/// most once.
pub struct CommandRunner<'a> {
    connection: &'a dyn Connection,
    wait_budget: Duration,
    default_duration: Option<DurationCap>,
    lang: &'a str,
}

impl<'a> CommandRunner<'a> {
    /// Create a runner with the default wait budget and locale.
    pub fn new(connection: &'a dyn Connection) -> Self {
        Self {
            connection,
            wait_budget: DEFAULT_WAIT_BUDGET,
            default_duration: None,
            lang: DEFAULT_LANG,
        }
    }

    /// Set the ceiling of each multiplexer wait.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    /// Set the duration cap used when an invocation has none.
    pub fn default_duration(mut self, cap: Option<DurationCap>) -> Self {
        self.default_duration = cap;
        self
    }

    /// Set the locale injected as `LANG`.
    pub fn lang(mut self, lang: &'a str) -> Self {
        self.lang = lang;
        self
    }

    /// Execute `invocation` to completion.
    pub fn run(&self, invocation: &CommandInvocation) -> Result<ExecutionResult> {
        info!(command = %invocation.command_line, "running command");
        for advisory in invocation.advisories() {
            warn!(command = %invocation.command_line, "{advisory}");
        }

        let command = invocation.effective_command(self.default_duration);
        let env = invocation.effective_env(self.lang);
        let start = Instant::now();

        let channel = self
            .connection
            .open_command_channel(&command, &env, &invocation.options)
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidInput => RemoteExecError::InvalidArgument(e.to_string()),
                _ => RemoteExecError::Connectivity(format!(
                    "failed to open channel for {command:?}: {e}"
                )),
            })?;
        let mut guard = ChannelGuard::new(channel);

        // No input is ever sent.
        guard.channel.shutdown_write()?;

        // A fast command may already be done; its bytes would never raise
        // another readiness edge.
        guard.mux.capture_pending(guard.channel.as_mut())?;
        guard.register()?;

        // The remote `timeout` normally ends a capped command; the local
        // limit only catches a stalled transport or a missing `timeout`.
        let limit = invocation
            .duration
            .or(self.default_duration)
            .and_then(|cap| cap.as_duration().checked_add(self.wait_budget));
        // A limit too far out for the clock is no limit at all.
        let deadline = limit.and_then(|limit| start.checked_add(limit));

        let outcome = guard
            .mux
            .drain(guard.channel.as_mut(), self.wait_budget, deadline)?;
        if outcome == DrainOutcome::DeadlineElapsed {
            let limit = limit.unwrap_or(self.wait_budget);
            warn!(command = %command, ?limit, "command exceeded local deadline");
            return Err(RemoteExecError::Timeout(limit));
        }

        let exit_code = guard.channel.exit_status()?;
        let (stdout, stderr) = guard.mux.take();
        let result = ExecutionResult::from_raw(exit_code, &stdout, &stderr, start.elapsed());

        debug!(
            command = %command,
            exit_code,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            elapsed = ?result.duration(),
            "command finished"
        );
        Ok(result)
    }
}

/// Owns a channel for the duration of one run and releases it on every path.
struct ChannelGuard {
    channel: Box<dyn CommandChannel>,
    mux: StreamMultiplexer,
    registered: bool,
}

impl ChannelGuard {
    fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self {
            channel,
            mux: StreamMultiplexer::new(),
            registered: false,
        }
    }

    fn register(&mut self) -> Result<()> {
        self.mux.register(self.channel.as_ref())?;
        self.registered = true;
        Ok(())
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self.registered {
            if let Err(e) = self.mux.unregister(self.channel.as_ref()) {
                debug!("failed to unregister channel: {e}");
            }
        }
        if let Err(e) = self.channel.close() {
            debug!("failed to close channel: {e}");
        }
        self.mux.reset();
    }
}
