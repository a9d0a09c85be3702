//! Remote command execution and file transfer on the Proxmox host.
//!
//! [`Connector`] opens a [`RemoteSession`]; the SSH implementation lives in
//! [`ssh`]. Sessions are blocking and must be driven from a blocking thread.

pub mod ssh;

#[cfg(test)]
pub mod fake;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, SshConfig};

pub use ssh::SshConnector;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("authentication failed for user {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("remote file not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

/// Where and how to log in.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn from_config(config: &SshConfig) -> Result<Self, ConfigError> {
        let credential = match &config.key_file {
            Some(key) if !key.as_os_str().is_empty() => Credential::KeyFile(key.clone()),
            _ if !config.password.is_empty() => Credential::Password(config.password.clone()),
            _ => {
                return Err(ConfigError::Invalid(
                    "no SSH password or key file configured".into(),
                ))
            }
        };
        if config.host.trim().is_empty() {
            return Err(ConfigError::Invalid("no SSH host configured".into()));
        }

        Ok(Self {
            host: config.host.trim().to_string(),
            port: config.port,
            username: config.username.clone(),
            credential,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        })
    }
}

/// Exit information of a finished remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExit {
    /// `None` when the command died without reporting a status
    pub status: Option<i32>,
    pub stderr: String,
}

impl CommandExit {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: Vec<String>,
    pub exit: CommandExit,
}

/// Stdout of a running command, one line per item, in arrival order.
pub trait CommandOutput: Iterator<Item = Result<String, RemoteError>> {
    /// Wait for the command to end and collect its exit status and stderr.
    fn finish(self: Box<Self>) -> Result<CommandExit, RemoteError>;
}

pub trait RemoteSession: Send {
    /// Start `command` and stream its stdout.
    fn execute(&mut self, command: &str) -> Result<Box<dyn CommandOutput + '_>, RemoteError>;

    /// Copy a local file to `remote`. Returns bytes written.
    fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError>;

    /// Copy `remote` to a local file. Returns bytes written.
    fn download(
        &mut self,
        remote: &str,
        local: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError>;

    fn remove(&mut self, remote: &str) -> Result<(), RemoteError>;

    /// Size of a remote file.
    fn stat(&mut self, remote: &str) -> Result<u64, RemoteError>;

    /// Run a command to completion and collect everything it printed.
    fn run(&mut self, command: &str) -> Result<CommandResult, RemoteError> {
        let mut output = self.execute(command)?;
        let mut stdout = Vec::new();
        for line in output.by_ref() {
            stdout.push(line?);
        }
        let exit = output.finish()?;
        Ok(CommandResult { stdout, exit })
    }
}

pub trait Connector: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError>;
}
