//! # remote-exec
//!
//! Hang-free remote command execution and privilege-aware file transfer
//! over a single SSH connection.
//!
//! ## Features
//!
//! - **Non-blocking execution**: stdout and stderr are drained by an
//!   event-driven multiplexer, so a chatty stderr never deadlocks stdout
//! - **Duration caps**: commands are wrapped in the remote `timeout` utility
//! - **Sudo fallback**: uploads and downloads that hit a permission error
//!   retry once through a staging directory and elevated commands
//! - **Backends**: libssh2 over TCP, or local `sh -c` subprocesses
//!
//! ## Quick Start
//!
//! ```no_run
//! use remote_exec::transfer::TransferOptions;
//! use remote_exec::transport::{SshAuth, SshConfig, SshConnection};
//! use remote_exec::{Session, SessionConfig};
//!
//! fn main() -> remote_exec::Result<()> {
//!     remote_exec::logging::try_init().ok();
//!
//!     let config = SshConfig::new("db1.example.com", "deploy", SshAuth::Agent);
//!     let connection = SshConnection::connect(&config)?;
//!     let session = Session::new(connection, SessionConfig::default().duration_secs(30.0)?)?;
//!
//!     let result = session.run("uname -a")?;
//!     println!("{} {}", result.exit_code(), result.stdout());
//!
//!     session.put_with(
//!         "app.conf",
//!         "/etc/app/",
//!         TransferOptions::default().use_privilege_escalation(true),
//!     )?;
//!     session.close()
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-export commonly used types
pub use error::{RemoteExecError, Result};
pub use execution::{CommandInvocation, CommandRunner, ExecutionResult};
pub use session::{AsyncSession, Session, SessionConfig};
pub use transfer::{TransferEngine, TransferOptions};
pub use transport::{Connection, LocalConnection, SshConnection};
