//! Command building and representation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::RemoteExecError;
use crate::Result;

/// Locale injected when the caller does not set `LANG`.
pub const DEFAULT_LANG: &str = "en_US.UTF-8";

/// A remote-enforced wall-clock limit, in seconds.
///
/// Always positive, finite and representable as a [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct DurationCap {
    secs: f64,
    duration: Duration,
}

impl DurationCap {
    /// Create a cap of `secs` seconds.
    pub fn from_secs(secs: f64) -> Result<Self> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(RemoteExecError::InvalidArgument(format!(
                "duration must be a positive finite number of seconds, got {secs}"
            )));
        }
        let duration = Duration::try_from_secs_f64(secs).map_err(|_| {
            RemoteExecError::InvalidArgument(format!("duration of {secs} seconds is too large"))
        })?;
        Ok(Self { secs, duration })
    }

    /// The cap in seconds.
    pub fn as_secs_f64(&self) -> f64 {
        self.secs
    }

    /// The cap as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        self.duration
    }

    /// Wrap `command` so the remote side terminates it after the cap.
    pub fn wrap(&self, command: &str) -> String {
        format!("timeout {} {}", self, command)
    }
}

impl fmt::Display for DurationCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.secs)
    }
}

impl TryFrom<f64> for DurationCap {
    type Error = RemoteExecError;

    fn try_from(secs: f64) -> Result<Self> {
        Self::from_secs(secs)
    }
}

/// Non-fatal notes about a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advisory {
    /// The command contains a pipe; its exit status reflects the last stage only.
    PipeExitStatus,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipeExitStatus => {
                f.write_str("pipe in command, exit code is determined by the last command")
            }
        }
    }
}

/// A command to be executed on the remote host.
#[derive(Debug, Clone, Default)]
pub struct CommandInvocation {
    /// The command line to execute.
    pub command_line: String,
    /// Remote-enforced duration cap.
    pub duration: Option<DurationCap>,
    /// Environment variables to request on the channel.
    pub env: HashMap<String, String>,
    /// Backend-specific channel options, handed to the connection as is.
    ///
    /// Keys the backend does not support fail the run with `InvalidArgument`.
    pub options: HashMap<String, String>,
}

impl CommandInvocation {
    /// Create a new invocation with the given command line.
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            ..Default::default()
        }
    }

    /// Set the duration cap.
    pub fn duration(mut self, cap: DurationCap) -> Self {
        self.duration = Some(cap);
        self
    }

    /// Set the duration cap from seconds, validating it.
    pub fn duration_secs(self, secs: f64) -> Result<Self> {
        Ok(self.duration(DurationCap::from_secs(secs)?))
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Add a backend-specific option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// The command text actually sent, with `fallback_duration` used when
    /// the invocation has no cap of its own.
    pub fn effective_command(&self, fallback_duration: Option<DurationCap>) -> String {
        match self.duration.or(fallback_duration) {
            Some(cap) => cap.wrap(&self.command_line),
            None => self.command_line.clone(),
        }
    }

    /// The environment actually sent: overrides plus `LANG` if absent.
    pub fn effective_env(&self, default_lang: &str) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.entry("LANG".to_string())
            .or_insert_with(|| default_lang.to_string());
        env
    }

    /// Notes about the command line that callers should see.
    pub fn advisories(&self) -> Vec<Advisory> {
        let mut notes = Vec::new();
        if self.command_line.contains('|') {
            notes.push(Advisory::PipeExitStatus);
        }
        notes
    }
}

impl From<&str> for CommandInvocation {
    fn from(command_line: &str) -> Self {
        Self::new(command_line)
    }
}

impl From<String> for CommandInvocation {
    fn from(command_line: String) -> Self {
        Self::new(command_line)
    }
}
