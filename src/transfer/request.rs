//! Validated transfer requests.
//!
//! Building a request performs every local check and every remote path
//! syntax check, so a rejected request never touches the network.

use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::path;
use crate::error::{Location, PathKind, RemoteExecError, Stage};
use crate::Result;

/// Flags shared by uploads and downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Copy the source's permission bits onto the destination.
    pub preserve_mode: bool,
    /// Retry permission failures once through elevated commands.
    pub use_privilege_escalation: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            preserve_mode: true,
            use_privilege_escalation: false,
        }
    }
}

impl TransferOptions {
    /// Set whether permission bits are preserved.
    pub fn preserve_mode(mut self, preserve: bool) -> Self {
        self.preserve_mode = preserve;
        self
    }

    /// Set whether elevated fallbacks are allowed.
    pub fn use_privilege_escalation(mut self, escalate: bool) -> Self {
        self.use_privilege_escalation = escalate;
        self
    }
}

/// A checked `put`.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    local: PathBuf,
    remote: String,
}

impl UploadRequest {
    /// Validate an upload of local file `local` to absolute remote path `remote`.
    pub fn new(local: impl AsRef<Path>, remote: &str) -> Result<Self> {
        let local = absolutize(local.as_ref())?;
        match fs::metadata(&local) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(RemoteExecError::InvalidArgument(format!(
                    "{} is not a regular file",
                    local.display()
                )))
            }
            Err(e) => return Err(local_error(&local, e)),
        }
        validate_remote(remote)?;
        Ok(Self {
            local,
            remote: remote.to_string(),
        })
    }

    /// Absolute local source.
    pub fn local(&self) -> &Path {
        &self.local
    }

    /// Remote destination as given.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Final component of the local source.
    pub fn file_name(&self) -> String {
        self.local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A checked `get`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    remote: String,
    local: PathBuf,
}

impl DownloadRequest {
    /// Validate a download of absolute remote file `remote` to `local`.
    ///
    /// `local` may not be a directory. When it does not exist its parent
    /// must, and a trailing separator is read as directory intent.
    pub fn new(remote: &str, local: impl AsRef<Path>) -> Result<Self> {
        validate_remote(remote)?;
        let raw = local.as_ref();
        let dir_intent = raw.as_os_str().as_bytes().last() == Some(&b'/');
        let local = absolutize(raw)?;

        let not_a_file = |path: &Path| RemoteExecError::TypeMismatch {
            location: Location::Local,
            path: path.display().to_string(),
            expected: PathKind::File,
        };

        match fs::metadata(&local) {
            Ok(meta) if meta.is_dir() => return Err(not_a_file(&local)),
            Ok(_) => {}
            Err(_) if dir_intent => return Err(not_a_file(&local)),
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::ENOTDIR) =>
            {
                if let Some(parent) = local.parent() {
                    match fs::metadata(parent) {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => {
                            return Err(RemoteExecError::TypeMismatch {
                                location: Location::Local,
                                path: parent.display().to_string(),
                                expected: PathKind::Directory,
                            })
                        }
                        Err(e) => return Err(local_error(parent, e)),
                    }
                }
            }
            Err(e) => return Err(local_error(&local, e)),
        }

        Ok(Self {
            remote: remote.to_string(),
            local,
        })
    }

    /// Remote source.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Absolute local destination.
    pub fn local(&self) -> &Path {
        &self.local
    }
}

/// Reject empty and relative remote paths.
pub fn validate_remote(remote: &str) -> Result<()> {
    if remote.is_empty() {
        return Err(RemoteExecError::InvalidArgument(
            "remote path must not be empty".to_string(),
        ));
    }
    if !path::is_absolute(remote) {
        return Err(RemoteExecError::InvalidArgument(format!(
            "remote path must be absolute, got {remote:?}"
        )));
    }
    Ok(())
}

fn absolutize(local: &Path) -> Result<PathBuf> {
    if local.as_os_str().is_empty() {
        return Err(RemoteExecError::InvalidArgument(
            "local path must not be empty".to_string(),
        ));
    }
    if local.is_absolute() {
        return Ok(local.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(local))
}

fn local_error(path: &Path, err: io::Error) -> RemoteExecError {
    RemoteExecError::from_io(Location::Local, path.display().to_string(), Stage::Validate, err)
}
