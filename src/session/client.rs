//! The blocking session.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use super::SessionConfig;
use crate::error::RemoteExecError;
use crate::execution::{CommandInvocation, CommandRunner, ExecutionResult};
use crate::transfer::{
    DownloadRequest, Escalation, Sudo, TransferEngine, TransferOptions, UploadRequest,
};
use crate::transport::{Connection, TransferHandle};
use crate::Result;

/// One connection plus everything needed to run commands and move files
/// over it.
///
/// A session is `Send + Sync`; share it behind an [`Arc`] to issue commands
/// and transfers from several threads. The transfer handle is opened on first
/// use and shared by every caller afterwards.
pub struct Session {
    connection: Box<dyn Connection>,
    config: SessionConfig,
    escalation: Box<dyn Escalation>,
    transfer: OnceLock<Arc<dyn TransferHandle>>,
    transfer_init: Mutex<()>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session over `connection`.
    pub fn new(connection: impl Connection + 'static, config: SessionConfig) -> Result<Self> {
        Self::from_boxed(Box::new(connection), config)
    }

    /// Create a session over an already boxed connection.
    pub fn from_boxed(connection: Box<dyn Connection>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connection,
            config,
            escalation: Box::new(Sudo::new()),
            transfer: OnceLock::new(),
            transfer_init: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the escalation used by transfer fallbacks.
    pub fn with_escalation(mut self, escalation: impl Escalation + 'static) -> Self {
        self.escalation = Box::new(escalation);
        self
    }

    /// Session defaults.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check if [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RemoteExecError::SessionClosed);
        }
        Ok(())
    }

    fn runner(&self) -> CommandRunner<'_> {
        CommandRunner::new(self.connection.as_ref())
            .wait_budget(self.config.wait_budget)
            .default_duration(self.config.duration)
            .lang(&self.config.lang)
    }

    /// Run `command` with the session defaults.
    pub fn run(&self, command: &str) -> Result<ExecutionResult> {
        self.execute(&CommandInvocation::new(command))
    }

    /// Run a fully specified invocation.
    pub fn execute(&self, invocation: &CommandInvocation) -> Result<ExecutionResult> {
        self.ensure_open()?;
        self.runner().run(invocation)
    }

    /// The shared transfer handle, opened on first call.
    ///
    /// Concurrent first calls all receive the same instance.
    pub fn transfer_handle(&self) -> Result<Arc<dyn TransferHandle>> {
        self.ensure_open()?;
        if let Some(handle) = self.transfer.get() {
            return Ok(Arc::clone(handle));
        }

        let _init = self
            .transfer_init
            .lock()
            .map_err(|_| RemoteExecError::LockPoisoned)?;
        if let Some(handle) = self.transfer.get() {
            return Ok(Arc::clone(handle));
        }
        self.ensure_open()?;

        let handle = self.connection.open_transfer_channel().map_err(|e| {
            RemoteExecError::Connectivity(format!("failed to open transfer channel: {e}"))
        })?;
        debug!("transfer channel opened");
        Ok(Arc::clone(self.transfer.get_or_init(|| handle)))
    }

    /// Upload with default options.
    pub fn put(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        self.put_with(local, remote, TransferOptions::default())
    }

    /// Upload `local` to the absolute remote path `remote`.
    ///
    /// If `remote` is a directory the file keeps its name inside it.
    pub fn put_with(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        options: TransferOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let request = UploadRequest::new(local, remote)?;
        let handle = self.transfer_handle()?;
        let runner = self.runner();
        self.engine(&runner, handle.as_ref()).put(&request, options)
    }

    /// Download with default options.
    pub fn get(&self, remote: &str, local: impl AsRef<Path>) -> Result<()> {
        self.get_with(remote, local, TransferOptions::default())
    }

    /// Download the absolute remote file `remote` to `local`.
    pub fn get_with(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        options: TransferOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let request = DownloadRequest::new(remote, local)?;
        let handle = self.transfer_handle()?;
        let runner = self.runner();
        self.engine(&runner, handle.as_ref()).get(&request, options)
    }

    fn engine<'a>(
        &'a self,
        runner: &'a CommandRunner<'a>,
        handle: &'a dyn TransferHandle,
    ) -> TransferEngine<'a> {
        TransferEngine::new(runner, handle, self.escalation.as_ref())
            .staging_dir(&self.config.staging_dir)
    }

    /// Close the transfer handle, if any, then the connection.
    ///
    /// Both are attempted even if the first fails. Later calls do nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let transfer = match self.transfer.get() {
            Some(handle) => handle.close().map_err(|e| {
                warn!("failed to close transfer channel: {e}");
                RemoteExecError::Connectivity(format!("failed to close transfer channel: {e}"))
            }),
            None => Ok(()),
        };
        let connection = self.connection.close().map_err(|e| {
            RemoteExecError::Connectivity(format!("failed to close connection: {e}"))
        });
        info!("session closed");
        transfer.and(connection)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("error while closing session on drop: {e}");
        }
    }
}
