//! Error types for remote-exec.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transfer::FallbackStage;

/// Which side of a transfer a path lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The machine running this crate.
    Local,
    /// The host at the other end of the connection.
    Remote,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// The kind of filesystem entry an operation required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("a regular file"),
            Self::Directory => f.write_str("a directory"),
        }
    }
}

/// Stage of a transfer at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Local argument validation.
    Validate,
    /// Destination or source inspection.
    Inspect,
    /// Direct byte transfer.
    Transfer,
    /// Transfer through the staging location.
    Staging,
    /// Permission bit preservation.
    Mode,
    /// Removal of staged copies.
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Inspect => "inspect",
            Self::Transfer => "transfer",
            Self::Staging => "staging",
            Self::Mode => "mode",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Main error type for remote-exec operations.
#[derive(Error, Debug)]
pub enum RemoteExecError {
    /// Opening a channel or talking to the transport failed.
    #[error("connection error: {0}")]
    Connectivity(String),

    /// An argument was rejected before any I/O happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A path does not exist.
    #[error("{location} path not found: {path}")]
    NotFound { location: Location, path: String },

    /// A path exists but is the wrong kind of entry.
    #[error("{location} path {path:?} is not {expected} or does not exist")]
    TypeMismatch {
        location: Location,
        path: String,
        expected: PathKind,
    },

    /// The acting user lacks permission and no fallback was allowed.
    #[error("permission denied on {location} path {path} during {stage}")]
    PermissionDenied {
        location: Location,
        path: String,
        stage: Stage,
    },

    /// An elevated command exited non-zero.
    #[error("{stage} failed for remote path {path} (exit code {exit_code}): {stderr}")]
    FallbackFailure {
        stage: FallbackStage,
        path: String,
        exit_code: i32,
        stderr: String,
    },

    /// Expected text was missing from a command's output.
    #[error("could not find {expected} in output of {command:?}")]
    PatternMatch {
        expected: &'static str,
        command: String,
    },

    /// Any other transfer sub-channel failure.
    #[error("transfer error on {location} path {path} during {stage}: {source}")]
    Transfer {
        location: Location,
        path: String,
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    /// The local deadline of a duration-capped command elapsed.
    #[error("command did not finish within its local deadline of {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// The session has already been closed.
    #[error("session closed")]
    SessionClosed,

    /// A blocking task of the async facade did not complete.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl RemoteExecError {
    /// Classify a sub-channel I/O error against the path it concerned.
    ///
    /// `NotFound` and `PermissionDenied` keep their kind; everything else
    /// becomes [`RemoteExecError::Transfer`].
    pub fn from_io(
        location: Location,
        path: impl Into<String>,
        stage: Stage,
        err: std::io::Error,
    ) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { location, path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                location,
                path,
                stage,
            },
            _ => Self::Transfer {
                location,
                path,
                stage,
                source: err,
            },
        }
    }

    /// Check if this error is a permission failure.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

/// Convenience Result type for remote-exec operations.
pub type Result<T> = std::result::Result<T, RemoteExecError>;
