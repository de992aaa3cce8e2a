//! Execution result types.

use std::time::Duration;

/// Result of one remote command: exit code plus decoded output streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration: Duration,
}

impl ExecutionResult {
    /// Create a result from already decoded text.
    pub fn new(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }

    /// Create a result from raw stream bytes.
    ///
    /// Invalid UTF-8 sequences are replaced with U+FFFD.
    pub fn from_raw(exit_code: i32, stdout: &[u8], stderr: &[u8], duration: Duration) -> Self {
        Self::new(
            exit_code,
            String::from_utf8_lossy(stdout).into_owned(),
            String::from_utf8_lossy(stderr).into_owned(),
            duration,
        )
    }

    /// Remote exit code.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Decoded standard output.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Decoded standard error.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Local wall-clock time spent on the command.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Check if command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Check if the remote `timeout` wrapper killed the command.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// Get stdout trimmed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Split into `(exit_code, stdout, stderr)`.
    pub fn into_parts(self) -> (i32, String, String) {
        (self.exit_code, self.stdout, self.stderr)
    }
}

/// Exit code conventionally reported by `timeout(1)` when it kills a command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
