//! Async facade over [`Session`].

use std::path::PathBuf;
use std::sync::Arc;

use super::Session;
use crate::error::RemoteExecError;
use crate::execution::{CommandInvocation, ExecutionResult};
use crate::transfer::TransferOptions;
use crate::Result;

/// Runs every session call on tokio's blocking pool.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct AsyncSession {
    inner: Arc<Session>,
}

impl AsyncSession {
    /// Wrap `session`.
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(session),
        }
    }

    /// Wrap an already shared session.
    pub fn from_shared(session: Arc<Session>) -> Self {
        Self { inner: session }
    }

    /// The wrapped session.
    pub fn session(&self) -> &Arc<Session> {
        &self.inner
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&session))
            .await
            .map_err(|e| RemoteExecError::TaskFailed(e.to_string()))?
    }

    /// See [`Session::run`].
    pub async fn run(&self, command: impl Into<String>) -> Result<ExecutionResult> {
        let invocation = CommandInvocation::new(command);
        self.execute(invocation).await
    }

    /// See [`Session::execute`].
    pub async fn execute(&self, invocation: CommandInvocation) -> Result<ExecutionResult> {
        self.blocking(move |session| session.execute(&invocation))
            .await
    }

    /// See [`Session::put_with`].
    pub async fn put(
        &self,
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
        options: TransferOptions,
    ) -> Result<()> {
        let local = local.into();
        let remote = remote.into();
        self.blocking(move |session| session.put_with(&local, &remote, options))
            .await
    }

    /// See [`Session::get_with`].
    pub async fn get(
        &self,
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Result<()> {
        let remote = remote.into();
        let local = local.into();
        self.blocking(move |session| session.get_with(&remote, &local, options))
            .await
    }

    /// See [`Session::close`].
    pub async fn close(&self) -> Result<()> {
        self.blocking(|session| session.close()).await
    }
}
