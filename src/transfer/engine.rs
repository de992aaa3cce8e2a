//! Privilege-aware upload and download.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, info, warn};

use super::escalation::{parse_stat_mode, Escalation, FallbackCommand};
use super::path;
use super::request::{DownloadRequest, TransferOptions, UploadRequest};
use crate::error::{Location, PathKind, RemoteExecError, Stage};
use crate::execution::{CommandInvocation, CommandRunner, ExecutionResult};
use crate::transport::TransferHandle;
use crate::Result;

/// Default staging directory for escalated transfers.
pub const DEFAULT_STAGING_DIR: &str = "/tmp";

/// Moves files over a transfer handle, falling back to elevated commands
/// exactly once per permission failure when allowed.
pub struct TransferEngine<'a> {
    runner: &'a CommandRunner<'a>,
    handle: &'a dyn TransferHandle,
    escalation: &'a dyn Escalation,
    staging_dir: &'a str,
}

fn is_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

fn remote_error(path: &str, stage: Stage, err: io::Error) -> RemoteExecError {
    RemoteExecError::from_io(Location::Remote, path, stage, err)
}

fn local_error(path: &Path, stage: Stage, err: io::Error) -> RemoteExecError {
    RemoteExecError::from_io(Location::Local, path.display().to_string(), stage, err)
}

impl<'a> TransferEngine<'a> {
    /// Create an engine staging through [`DEFAULT_STAGING_DIR`].
    pub fn new(
        runner: &'a CommandRunner<'a>,
        handle: &'a dyn TransferHandle,
        escalation: &'a dyn Escalation,
    ) -> Self {
        Self {
            runner,
            handle,
            escalation,
            staging_dir: DEFAULT_STAGING_DIR,
        }
    }

    /// Set the staging directory.
    pub fn staging_dir(mut self, dir: &'a str) -> Self {
        self.staging_dir = dir;
        self
    }

    /// Upload `request.local()` to `request.remote()`.
    pub fn put(&self, request: &UploadRequest, options: TransferOptions) -> Result<()> {
        let local = request.local();
        let target = self.resolve_upload_target(request.remote(), &request.file_name(), options)?;

        if self.handle.stat(&target).is_ok() {
            warn!(remote = %target, "remote file exists, overwriting");
        }

        info!(local = %local.display(), remote = %target, "uploading");
        self.upload(local, &target, options)?;

        if options.preserve_mode {
            let mode = fs::metadata(local)
                .map_err(|e| local_error(local, Stage::Mode, e))?
                .permissions()
                .mode()
                & 0o7777;
            self.set_remote_mode(&target, mode, options)?;
        }
        Ok(())
    }

    /// Download `request.remote()` to `request.local()`.
    pub fn get(&self, request: &DownloadRequest, options: TransferOptions) -> Result<()> {
        let remote = request.remote();
        let local = request.local();
        self.check_download_source(remote, options)?;

        if local.exists() {
            warn!(local = %local.display(), "local file exists, overwriting");
        }

        info!(remote, local = %local.display(), "downloading");
        match self.handle.get(remote, local) {
            Ok(()) => {}
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                self.fetch_staged(remote, local)?;
            }
            Err(e) => return Err(remote_error(remote, Stage::Transfer, e)),
        }

        if options.preserve_mode {
            let mode = self.remote_mode(remote, options)?;
            apply_local_mode(local, mode)?;
        }
        Ok(())
    }

    fn resolve_upload_target(
        &self,
        remote: &str,
        file_name: &str,
        options: TransferOptions,
    ) -> Result<String> {
        match self.handle.stat(remote) {
            Ok(stat) if stat.is_dir() => Ok(path::join(remote, file_name)),
            Ok(_) => Ok(remote.to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = path::dirname(remote);
                if parent == "/" {
                    return Err(RemoteExecError::NotFound {
                        location: Location::Remote,
                        path: remote.to_string(),
                    });
                }
                // A missing leaf is a new file, but only inside an existing directory.
                match self.handle.stat(parent) {
                    Ok(stat) if stat.is_dir() => Ok(remote.to_string()),
                    Ok(_) => Err(RemoteExecError::TypeMismatch {
                        location: Location::Remote,
                        path: parent.to_string(),
                        expected: PathKind::Directory,
                    }),
                    Err(e) => Err(remote_error(parent, Stage::Inspect, e)),
                }
            }
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                debug!(remote, "stat denied, checking with escalation");
                if self.check(FallbackCommand::IsDirectory { path: remote })? {
                    return Ok(path::join(remote, file_name));
                }
                let parent = path::dirname(remote);
                if !self.check(FallbackCommand::IsDirectory { path: parent })? {
                    return Err(RemoteExecError::TypeMismatch {
                        location: Location::Remote,
                        path: parent.to_string(),
                        expected: PathKind::Directory,
                    });
                }
                Ok(remote.to_string())
            }
            Err(e) => Err(remote_error(remote, Stage::Inspect, e)),
        }
    }

    fn upload(&self, local: &Path, target: &str, options: TransferOptions) -> Result<()> {
        match self.handle.put(local, target) {
            Ok(()) => Ok(()),
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                let staged = self.staged_path(target);
                info!(staged = %staged, remote = %target, "direct upload denied, staging");
                self.handle
                    .put(local, &staged)
                    .map_err(|e| remote_error(&staged, Stage::Staging, e))?;
                self.fallback(FallbackCommand::Move {
                    staged: &staged,
                    path: target,
                })?;
                Ok(())
            }
            Err(e) => Err(remote_error(target, Stage::Transfer, e)),
        }
    }

    fn set_remote_mode(&self, target: &str, mode: u32, options: TransferOptions) -> Result<()> {
        match self.handle.chmod(target, mode) {
            Ok(()) => Ok(()),
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                self.fallback(FallbackCommand::Chmod { mode, path: target })?;
                Ok(())
            }
            Err(e) => Err(remote_error(target, Stage::Mode, e)),
        }
    }

    fn check_download_source(&self, remote: &str, options: TransferOptions) -> Result<()> {
        let not_a_file = || RemoteExecError::TypeMismatch {
            location: Location::Remote,
            path: remote.to_string(),
            expected: PathKind::File,
        };
        match self.handle.stat(remote) {
            Ok(stat) if stat.is_dir() => Err(not_a_file()),
            Ok(_) => Ok(()),
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                debug!(remote, "stat denied, checking with escalation");
                if self.check(FallbackCommand::IsFile { path: remote })? {
                    Ok(())
                } else {
                    Err(not_a_file())
                }
            }
            Err(e) => Err(remote_error(remote, Stage::Inspect, e)),
        }
    }

    fn fetch_staged(&self, remote: &str, local: &Path) -> Result<()> {
        let staged = self.staged_path(remote);
        info!(staged = %staged, remote, "direct download denied, staging");

        self.fallback(FallbackCommand::Copy {
            path: remote,
            staged: &staged,
        })?;
        let whoami = self.fallback(FallbackCommand::WhoAmI)?;
        let user = whoami.stdout_trimmed();
        if user.is_empty() {
            return Err(RemoteExecError::PatternMatch {
                expected: "a login name",
                command: FallbackCommand::WhoAmI.render(self.escalation),
            });
        }
        self.fallback(FallbackCommand::Chown {
            user,
            staged: &staged,
        })?;

        let fetched = self
            .handle
            .get(&staged, local)
            .map_err(|e| remote_error(&staged, Stage::Staging, e));
        let removed = self.remove_staged(&staged);
        match (fetched, removed) {
            (Err(e), Err(cleanup)) => {
                warn!(staged = %staged, "failed to remove staged copy: {cleanup}");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), removed) => removed,
        }
    }

    fn remove_staged(&self, staged: &str) -> Result<()> {
        match self.handle.remove(staged) {
            Ok(()) => Ok(()),
            // The staged copy was only created through escalation, so
            // removing it that way is always allowed.
            Err(e) if is_denied(&e) => {
                self.fallback(FallbackCommand::Remove { staged })?;
                Ok(())
            }
            Err(e) => Err(remote_error(staged, Stage::Cleanup, e)),
        }
    }

    fn remote_mode(&self, remote: &str, options: TransferOptions) -> Result<u32> {
        match self.handle.stat(remote) {
            Ok(stat) => Ok(stat.permissions()),
            Err(e) if is_denied(&e) && options.use_privilege_escalation => {
                let command = FallbackCommand::Stat { path: remote };
                let output = self.fallback(command)?;
                parse_stat_mode(output.stdout()).ok_or_else(|| RemoteExecError::PatternMatch {
                    expected: "an octal access mode",
                    command: command.render(self.escalation),
                })
            }
            Err(e) => Err(remote_error(remote, Stage::Mode, e)),
        }
    }

    fn staged_path(&self, target: &str) -> String {
        path::join(self.staging_dir, path::basename(target))
    }

    /// Run an elevated existence or type check. A non-zero exit means "no".
    fn check(&self, command: FallbackCommand<'_>) -> Result<bool> {
        let result = self.exec(&command)?;
        debug!(
            stage = %command.stage(),
            path = command.path(),
            exit_code = result.exit_code(),
            "check finished"
        );
        Ok(result.success())
    }

    /// Run a fallback step; a non-zero exit is fatal.
    fn fallback(&self, command: FallbackCommand<'_>) -> Result<ExecutionResult> {
        let result = self.exec(&command)?;
        if !result.success() {
            return Err(RemoteExecError::FallbackFailure {
                stage: command.stage(),
                path: command.path().to_string(),
                exit_code: result.exit_code(),
                stderr: result.stderr().trim().to_string(),
            });
        }
        Ok(result)
    }

    fn exec(&self, command: &FallbackCommand<'_>) -> Result<ExecutionResult> {
        let text = command.render(self.escalation);
        self.runner.run(&CommandInvocation::new(text))
    }
}

/// Apply `mode` to `local` and hand it to the current effective user.
fn apply_local_mode(local: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(local, fs::Permissions::from_mode(mode))
        .map_err(|e| local_error(local, Stage::Mode, e))?;
    let uid = rustix::process::geteuid().as_raw();
    let gid = rustix::process::getegid().as_raw();
    std::os::unix::fs::chown(local, Some(uid), Some(gid))
        .map_err(|e| local_error(local, Stage::Mode, e))?;
    Ok(())
}
