//! Configuration management for remote-exec.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::execution::{DurationCap, DEFAULT_LANG};
use crate::session::SessionConfig;
use crate::transfer::{Sudo, DEFAULT_ESCALATION, DEFAULT_STAGING_DIR};
use crate::transport::ssh::DEFAULT_IO_TIMEOUT;
use crate::transport::{KeyAlgorithm, SshAuth, SshConfig};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection configuration.
    pub connection: ConnectionSection,
    /// Command execution defaults.
    pub execution: ExecutionSection,
    /// Transfer defaults.
    pub transfer: TransferSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Connection configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Remote host.
    pub host: Option<String>,
    /// Remote port.
    pub port: u16,
    /// Login name.
    pub username: Option<String>,
    /// Password for password authentication.
    pub password: Option<String>,
    /// Private key file.
    pub private_key: Option<PathBuf>,
    /// Passphrase of the private key.
    pub passphrase: Option<String>,
    /// Key algorithm tag. When set, the key file is loaded into memory.
    pub key_algorithm: Option<String>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: Option<f64>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            username: None,
            password: None,
            private_key: None,
            passphrase: None,
            key_algorithm: None,
            connect_timeout_secs: None,
        }
    }
}

/// Command execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Default duration cap in seconds.
    pub duration_secs: Option<f64>,
    /// Ceiling of each multiplexer wait, in seconds.
    pub wait_budget_secs: f64,
    /// Locale injected as `LANG`.
    pub lang: String,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            duration_secs: None,
            wait_budget_secs: 10.0,
            lang: DEFAULT_LANG.to_string(),
        }
    }
}

/// Transfer section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Remote staging directory for escalated transfers.
    pub staging_dir: String,
    /// Escalation program.
    pub escalation: String,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            escalation: DEFAULT_ESCALATION.to_string(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn positive_secs(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidValue(name, secs.to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue(name, e.to_string()))
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup.
    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("REMOTE_EXEC_HOST") {
            self.connection.host = Some(host);
        }

        if let Some(port) = var("REMOTE_EXEC_PORT") {
            if let Ok(port) = port.parse() {
                self.connection.port = port;
            }
        }

        if let Some(user) = var("REMOTE_EXEC_USER") {
            self.connection.username = Some(user);
        }

        if let Some(password) = var("REMOTE_EXEC_PASSWORD") {
            if !password.is_empty() {
                self.connection.password = Some(password);
            }
        }

        if let Some(key) = var("REMOTE_EXEC_KEY") {
            if !key.is_empty() {
                self.connection.private_key = Some(PathBuf::from(key));
            }
        }

        if let Some(level) = var("REMOTE_EXEC_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ref host) = args.host {
            self.connection.host = Some(host.clone());
        }

        if let Some(port) = args.port {
            self.connection.port = port;
        }

        if let Some(ref user) = args.user {
            self.connection.username = Some(user.clone());
        }

        if let Some(ref identity) = args.identity {
            self.connection.private_key = Some(identity.clone());
        }

        if let Some(secs) = args.duration {
            self.execution.duration_secs = Some(secs);
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Config::default();

        // Load from config file if specified
        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        // Apply environment variable overrides
        config.apply_env();

        // Apply CLI argument overrides (highest priority)
        config.apply_args(args);

        Ok(config)
    }

    /// Convert to session defaults.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let duration = self
            .execution
            .duration_secs
            .map(DurationCap::from_secs)
            .transpose()
            .map_err(|e| ConfigError::InvalidValue("execution.duration_secs", e.to_string()))?;
        let config = SessionConfig {
            duration,
            wait_budget: positive_secs(
                "execution.wait_budget_secs",
                self.execution.wait_budget_secs,
            )?,
            lang: self.execution.lang.clone(),
            staging_dir: self.transfer.staging_dir.clone(),
        };
        config
            .validate()
            .map_err(|e| ConfigError::InvalidValue("session", e.to_string()))?;
        Ok(config)
    }

    /// Convert to transport settings.
    ///
    /// Authentication preference: password, then private key, then agent.
    pub fn to_ssh_config(&self) -> Result<SshConfig, ConfigError> {
        let connection = &self.connection;
        let host = connection
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::Missing("connection.host"))?;
        let username = connection
            .username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("connection.username"))?;

        let auth = if let Some(ref password) = connection.password {
            SshAuth::Password(password.clone())
        } else if let Some(ref path) = connection.private_key {
            match connection.key_algorithm {
                Some(ref tag) => {
                    let algorithm: KeyAlgorithm = tag.parse().map_err(|_| {
                        ConfigError::InvalidValue("connection.key_algorithm", tag.clone())
                    })?;
                    let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
                    SshAuth::KeyText {
                        text,
                        algorithm,
                        passphrase: connection.passphrase.clone(),
                    }
                }
                None => SshAuth::KeyFile {
                    path: path.clone(),
                    passphrase: connection.passphrase.clone(),
                },
            }
        } else {
            SshAuth::Agent
        };

        let connect_timeout = connection
            .connect_timeout_secs
            .map(|secs| positive_secs("connection.connect_timeout_secs", secs))
            .transpose()?;

        Ok(SshConfig {
            host,
            port: connection.port,
            username,
            auth,
            connect_timeout,
            io_timeout: DEFAULT_IO_TIMEOUT,
            host_key_sha256: None,
        })
    }

    /// The configured escalation.
    pub fn escalation(&self) -> Sudo {
        Sudo::with_program(self.transfer.escalation.clone())
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config or key file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// A required setting is absent.
    Missing(&'static str),
    /// A setting has an unusable value.
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::Missing(name) => write!(f, "missing setting: {}", name),
            Self::InvalidValue(name, value) => write!(f, "invalid value for {}: {}", name, value),
        }
    }
}

impl std::error::Error for ConfigError {}
