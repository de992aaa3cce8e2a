//! Command execution engine.
//!
//! This module provides hang-free remote command execution:
//! - Duration-capped commands (`timeout <secs> <command>` on the remote side)
//! - Event-driven draining of stdout and stderr
//! - Guaranteed channel cleanup on every exit path
//!
//! # Example
//!
//! ```no_run
//! use remote_exec::execution::{CommandInvocation, CommandRunner};
//! use remote_exec::transport::LocalConnection;
//!
//! let connection = LocalConnection::new();
//! let result = CommandRunner::new(&connection)
//!     .run(&CommandInvocation::new("uname -s"))
//!     .unwrap();
//! println!("{} -> {}", result.exit_code(), result.stdout());
//! ```

mod command;
mod multiplexer;
mod result;
mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{Advisory, CommandInvocation, DurationCap, DEFAULT_LANG};
pub use multiplexer::{DrainOutcome, Selector, StreamMultiplexer};
pub use result::{ExecutionResult, TIMEOUT_EXIT_CODE};
pub use runner::{CommandRunner, DEFAULT_WAIT_BUDGET};
