//! File transfer with a privilege-escalation fallback.
//!
//! A transfer first tries the plain file-transfer sub-channel. When that is
//! refused for lack of permission and escalation is enabled, the engine runs
//! one fixed sequence of elevated commands through a staging directory:
//!
//! ```text
//! Validate -> InspectDestination -> DirectTransfer | EscalatedFallback
//!          -> DirectModeSet | EscalatedModeSet
//! ```
//!
//! Every permission failure triggers at most one fallback; nothing loops.

mod engine;
mod escalation;
pub mod path;
mod request;

pub use engine::{TransferEngine, DEFAULT_STAGING_DIR};
pub use escalation::{
    parse_stat_mode, Escalation, FallbackCommand, FallbackStage, Sudo, DEFAULT_ESCALATION,
};
pub use request::{validate_remote, DownloadRequest, TransferOptions, UploadRequest};
