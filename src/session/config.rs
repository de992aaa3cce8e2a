//! Per-session defaults.

use std::time::Duration;

use crate::error::RemoteExecError;
use crate::execution::{DurationCap, DEFAULT_LANG, DEFAULT_WAIT_BUDGET};
use crate::transfer::{path, DEFAULT_STAGING_DIR};
use crate::Result;

/// Defaults applied to every command and transfer of a [`Session`].
///
/// [`Session`]: super::Session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Duration cap for invocations that carry none.
    pub duration: Option<DurationCap>,
    /// Ceiling of each multiplexer wait.
    pub wait_budget: Duration,
    /// Locale injected as `LANG` when the caller sets none.
    pub lang: String,
    /// Remote directory used as the escalation staging location.
    pub staging_dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration: None,
            wait_budget: DEFAULT_WAIT_BUDGET,
            lang: DEFAULT_LANG.to_string(),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
        }
    }
}

impl SessionConfig {
    /// Set the default duration cap in seconds.
    pub fn duration_secs(mut self, secs: f64) -> Result<Self> {
        self.duration = Some(DurationCap::from_secs(secs)?);
        Ok(self)
    }

    /// Set the wait budget.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    /// Set the default locale.
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Set the staging directory.
    pub fn staging_dir(mut self, dir: impl Into<String>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.wait_budget.is_zero() {
            return Err(RemoteExecError::InvalidArgument(
                "wait budget must be positive".to_string(),
            ));
        }
        if self.lang.is_empty() {
            return Err(RemoteExecError::InvalidArgument(
                "locale must not be empty".to_string(),
            ));
        }
        if !path::is_absolute(&self.staging_dir) {
            return Err(RemoteExecError::InvalidArgument(format!(
                "staging directory must be absolute, got {:?}",
                self.staging_dir
            )));
        }
        Ok(())
    }
}
