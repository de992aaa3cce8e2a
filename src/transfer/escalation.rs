//! Elevated remote commands used when the acting user lacks permission.
//!
//! The engine never builds command text by hand: every step of a fallback is
//! one [`FallbackCommand`], rendered through an [`Escalation`].

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::path::quote;

/// Default escalation program.
pub const DEFAULT_ESCALATION: &str = "sudo";

/// Pattern locating the octal mode in `stat` output.
const STAT_MODE_PATTERN: &str = r"Access: \((\d+)/";

/// Turns a command into one that runs with elevated permissions.
pub trait Escalation: Send + Sync {
    /// Return the elevated form of `command`.
    fn elevate(&self, command: &str) -> String;
}

/// Prefix-style escalation such as `sudo` or `doas`.
#[derive(Debug, Clone)]
pub struct Sudo {
    program: String,
}

impl Sudo {
    /// Escalate through `sudo`.
    pub fn new() -> Self {
        Self::with_program(DEFAULT_ESCALATION)
    }

    /// Escalate through another prefix program.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The prefix program.
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for Sudo {
    fn default() -> Self {
        Self::new()
    }
}

impl Escalation for Sudo {
    fn elevate(&self, command: &str) -> String {
        format!("{} {command}", self.program)
    }
}

/// The closed set of fallback steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStage {
    /// Is the path a directory?
    IsDirectory,
    /// Is the path a regular file?
    IsFile,
    /// Move a staged upload into place.
    Move,
    /// Set permission bits.
    Chmod,
    /// Copy a file into the staging location.
    Copy,
    /// Discover the login identity.
    WhoAmI,
    /// Hand a staged copy to the login identity.
    Chown,
    /// Read file metadata as text.
    Stat,
    /// Remove a staged copy.
    Remove,
}

impl fmt::Display for FallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IsDirectory => "elevated directory check",
            Self::IsFile => "elevated file check",
            Self::Move => "elevated move",
            Self::Chmod => "elevated chmod",
            Self::Copy => "elevated copy",
            Self::WhoAmI => "whoami",
            Self::Chown => "elevated chown",
            Self::Stat => "elevated stat",
            Self::Remove => "elevated remove",
        };
        f.write_str(name)
    }
}

/// One fallback step with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackCommand<'a> {
    IsDirectory { path: &'a str },
    IsFile { path: &'a str },
    Move { staged: &'a str, path: &'a str },
    Chmod { mode: u32, path: &'a str },
    Copy { path: &'a str, staged: &'a str },
    WhoAmI,
    Chown { user: &'a str, staged: &'a str },
    Stat { path: &'a str },
    Remove { staged: &'a str },
}

impl FallbackCommand<'_> {
    /// The stage this command implements.
    pub fn stage(&self) -> FallbackStage {
        match self {
            Self::IsDirectory { .. } => FallbackStage::IsDirectory,
            Self::IsFile { .. } => FallbackStage::IsFile,
            Self::Move { .. } => FallbackStage::Move,
            Self::Chmod { .. } => FallbackStage::Chmod,
            Self::Copy { .. } => FallbackStage::Copy,
            Self::WhoAmI => FallbackStage::WhoAmI,
            Self::Chown { .. } => FallbackStage::Chown,
            Self::Stat { .. } => FallbackStage::Stat,
            Self::Remove { .. } => FallbackStage::Remove,
        }
    }

    /// The remote path the command is about, for error reports.
    pub fn path(&self) -> &str {
        match self {
            Self::IsDirectory { path }
            | Self::IsFile { path }
            | Self::Move { path, .. }
            | Self::Chmod { path, .. }
            | Self::Copy { path, .. }
            | Self::Stat { path } => path,
            Self::Chown { staged, .. } | Self::Remove { staged } => staged,
            Self::WhoAmI => "",
        }
    }

    /// Render the exact command text.
    pub fn render(&self, escalation: &dyn Escalation) -> String {
        match *self {
            Self::IsDirectory { path } => escalation.elevate(&format!("[ -d {} ]", quote(path))),
            Self::IsFile { path } => escalation.elevate(&format!("[ -f {} ]", quote(path))),
            Self::Move { staged, path } => {
                escalation.elevate(&format!("mv {} {}", quote(staged), quote(path)))
            }
            Self::Chmod { mode, path } => {
                escalation.elevate(&format!("chmod {mode:o} {}", quote(path)))
            }
            Self::Copy { path, staged } => {
                escalation.elevate(&format!("cp {} {}", quote(path), quote(staged)))
            }
            // Must report the login identity, so never elevated.
            Self::WhoAmI => "whoami".to_string(),
            Self::Chown { user, staged } => {
                let staged = quote(staged);
                let user = quote(user);
                format!(
                    "{} && {}",
                    escalation.elevate(&format!("[ -f {staged} ]")),
                    escalation.elevate(&format!("chown {user}:{user} {staged}"))
                )
            }
            Self::Stat { path } => escalation.elevate(&format!("stat {}", quote(path))),
            Self::Remove { staged } => escalation.elevate(&format!("rm -f {}", quote(staged))),
        }
    }
}

/// Extract the permission bits from `stat` output.
pub fn parse_stat_mode(output: &str) -> Option<u32> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(STAT_MODE_PATTERN)).as_ref().ok()?;
    let digits = pattern.captures(output)?.get(1)?.as_str();
    u32::from_str_radix(digits, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_OUTPUT: &str = "  File: /root/abc.txt\n  Size: 4\t\tBlocks: 8\n\
        Device: 803h/2051d\tInode: 1234\tLinks: 1\n\
        Access: (0640/-rw-r-----)  Uid: (    0/    root)   Gid: (    0/    root)\n\
        Access: 2024-01-01 00:00:00.000000000 +0000\n";

    #[test]
    fn test_sudo_templates() {
        let sudo = Sudo::new();
        let cases = [
            (FallbackCommand::IsDirectory { path: "/root" }, "sudo [ -d /root ]"),
            (FallbackCommand::IsFile { path: "/root/a.txt" }, "sudo [ -f /root/a.txt ]"),
            (
                FallbackCommand::Move {
                    staged: "/tmp/a.txt",
                    path: "/root/a.txt",
                },
                "sudo mv /tmp/a.txt /root/a.txt",
            ),
            (
                FallbackCommand::Chmod {
                    mode: 0o755,
                    path: "/root/a.txt",
                },
                "sudo chmod 755 /root/a.txt",
            ),
            (
                FallbackCommand::Copy {
                    path: "/root/a.txt",
                    staged: "/tmp/a.txt",
                },
                "sudo cp /root/a.txt /tmp/a.txt",
            ),
            (FallbackCommand::WhoAmI, "whoami"),
            (
                FallbackCommand::Chown {
                    user: "alice",
                    staged: "/tmp/a.txt",
                },
                "sudo [ -f /tmp/a.txt ] && sudo chown alice:alice /tmp/a.txt",
            ),
            (FallbackCommand::Stat { path: "/root/a.txt" }, "sudo stat /root/a.txt"),
            (FallbackCommand::Remove { staged: "/tmp/a.txt" }, "sudo rm -f /tmp/a.txt"),
        ];
        for (command, expected) in cases {
            assert_eq!(command.render(&sudo), expected);
        }
    }

    #[test]
    fn test_render_quotes_unsafe_paths() {
        let command = FallbackCommand::IsFile {
            path: "/srv/my file",
        };
        assert_eq!(command.render(&Sudo::new()), "sudo [ -f '/srv/my file' ]");
    }

    #[test]
    fn test_custom_program() {
        let doas = Sudo::with_program("doas");
        let command = FallbackCommand::Remove { staged: "/tmp/x" };
        assert_eq!(command.render(&doas), "doas rm -f /tmp/x");
    }

    #[test]
    fn test_stage_and_path() {
        let command = FallbackCommand::Chown {
            user: "bob",
            staged: "/tmp/x",
        };
        assert_eq!(command.stage(), FallbackStage::Chown);
        assert_eq!(command.path(), "/tmp/x");
        assert_eq!(FallbackStage::Move.to_string(), "elevated move");
    }

    #[test]
    fn test_parse_stat_mode() {
        assert_eq!(parse_stat_mode(STAT_OUTPUT), Some(0o640));
        assert_eq!(parse_stat_mode("Access: (4755/-rwsr-xr-x)"), Some(0o4755));
    }

    #[test]
    fn test_parse_stat_mode_missing() {
        assert_eq!(parse_stat_mode("stat: cannot stat"), None);
        assert_eq!(parse_stat_mode("Access: 2024-01-01"), None);
    }
}
