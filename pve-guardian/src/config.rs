//! Configuration management for pve-guardian.
//!
//! Loads configuration from a TOML file, then applies environment variable
//! overrides (a `.env` file is honoured) for secrets and the listen port.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pve-guardian/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ssh: SshConfig,
    pub schedule: ScheduleConfig,
    pub backup: BackupConfig,
    pub local: LocalConfig,
    pub offsite: OffsiteConfig,
    pub restore: RestoreConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the status/trigger API binds to
    pub bind: String,

    /// Port of the status/trigger API
    pub port: u16,

    /// Directory for the state database and scratch files
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,

    /// Password authentication, used when no key file is set
    pub password: String,

    /// Private key file; takes precedence over the password
    pub key_file: Option<PathBuf>,

    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,

    /// 5-field crontab expression, or 6-field with leading seconds
    pub cron: String,

    /// Trigger one backup shortly after startup
    pub run_on_start: bool,

    /// Extra attempts after the first failed one
    pub retry_count: u32,

    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    Snapshot,
    Suspend,
    Stop,
}

impl ConsistencyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyMode::Snapshot => "snapshot",
            ConsistencyMode::Suspend => "suspend",
            ConsistencyMode::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Gzip,
    Lzo,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Zstd => "zstd",
            Compression::Gzip => "gzip",
            Compression::Lzo => "lzo",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Comma-separated VMIDs; empty means every VM and container on the host
    pub vmids: String,

    /// Proxmox storage the dump is written to
    pub storage: String,

    pub mode: ConsistencyMode,
    pub compress: Compression,

    /// Remove the archive from the host once it is downloaded
    pub auto_delete_after_download: bool,

    /// Download every archive of a multi-guest dump instead of only the last one
    pub download_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub enabled: bool,

    /// Destination directory; defaults to `<data_dir>/actual_backups`
    pub path: Option<PathBuf>,

    /// Archives to keep; 0 disables cleanup
    pub keep: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsiteConfig {
    pub enabled: bool,
    pub url: String,
    pub username: String,
    pub password: String,

    /// Sub-path below the WebDAV mount point
    pub path: String,

    /// Archives to keep; 0 disables cleanup
    pub keep: usize,

    pub upload_retries: u32,
    pub upload_retry_delay_secs: u64,

    /// Timeout for listing and metadata requests
    pub timeout_secs: u64,

    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub enabled: bool,

    /// Target storage for restored disks; empty keeps the archive's layout
    pub storage: String,

    /// Target VMID override; empty derives it from the archive name
    pub vmid: String,

    /// Destroy an existing guest with the same VMID before restoring
    pub force: bool,

    /// Report and skip when the target VMID already exists
    pub skip_existing: bool,

    /// Directory on the host the archive is uploaded to
    pub remote_scratch_dir: String,

    /// Seconds to wait between stopping and destroying an existing guest
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,

    /// JSON webhook receiving one message per finished task
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8765,
            data_dir: PathBuf::from("/var/lib/pve-guardian"),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            password: String::new(),
            key_file: None,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 3 * * *".to_string(),
            run_on_start: false,
            retry_count: 0,
            retry_interval_secs: 60,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            vmids: String::new(),
            storage: "local".to_string(),
            mode: ConsistencyMode::Snapshot,
            compress: Compression::Zstd,
            auto_delete_after_download: false,
            download_all: false,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            keep: 7,
        }
    }
}

impl Default for OffsiteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            username: String::new(),
            password: String::new(),
            path: String::new(),
            keep: 7,
            upload_retries: 3,
            upload_retry_delay_secs: 5,
            timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: "local".to_string(),
            vmid: String::new(),
            force: false,
            skip_existing: true,
            remote_scratch_dir: "/tmp".to_string(),
            stop_grace_secs: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the given file (or the default path when it exists) and apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Ok(dir) = std::env::var("PVE_GUARDIAN_DATA_DIR") {
            self.server.data_dir = PathBuf::from(dir);
        }
        if let Ok(password) = std::env::var("PVE_GUARDIAN_SSH_PASSWORD") {
            self.ssh.password = password;
        }
        if let Ok(password) = std::env::var("PVE_GUARDIAN_OFFSITE_PASSWORD") {
            self.offsite.password = password;
        }
    }

    pub fn local_dir(&self) -> PathBuf {
        self.local
            .path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| self.server.data_dir.join("actual_backups"))
    }

    /// Scratch directory for archives pulled from offsite storage
    pub fn temp_dir(&self) -> PathBuf {
        self.server.data_dir.join("temp")
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("pve-guardian.db")
    }

    pub fn offsite_active(&self) -> bool {
        self.offsite.enabled && !self.offsite.url.trim().is_empty()
    }

    /// Host address, username and one credential must all be present.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        let has_key = self
            .ssh
            .key_file
            .as_ref()
            .is_some_and(|k| !k.as_os_str().is_empty());
        if self.ssh.host.trim().is_empty()
            || self.ssh.username.trim().is_empty()
            || (self.ssh.password.is_empty() && !has_key)
        {
            return Err(ConfigError::Invalid(
                "incomplete configuration: host address, SSH username or SSH credential (password/key) not set".into(),
            ));
        }
        Ok(())
    }

    /// Reject values that end up inside remote shell commands.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_storage_name(&self.backup.storage) {
            return Err(ConfigError::Invalid(format!(
                "invalid backup storage name '{}'",
                self.backup.storage
            )));
        }
        if !self.restore.storage.is_empty() && !is_storage_name(&self.restore.storage) {
            return Err(ConfigError::Invalid(format!(
                "invalid restore storage name '{}'",
                self.restore.storage
            )));
        }
        let vmid = self.restore.vmid.trim();
        if !vmid.is_empty() && !vmid.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!("invalid restore VMID '{vmid}'")));
        }
        if self.restore.remote_scratch_dir.chars().any(|c| c.is_whitespace() || "'\";$`|&".contains(c)) {
            return Err(ConfigError::Invalid(format!(
                "invalid remote scratch directory '{}'",
                self.restore.remote_scratch_dir
            )));
        }
        Ok(())
    }

    /// SHA-256 over every section that changes task behaviour.
    pub fn fingerprint(&self) -> String {
        let relevant = serde_json::json!({
            "ssh": self.ssh,
            "schedule": self.schedule,
            "backup": self.backup,
            "local": self.local,
            "offsite": self.offsite,
            "restore": self.restore,
            "notify": self.notify,
        });
        let digest = Sha256::digest(relevant.to_string().as_bytes());
        format!("{:x}", digest)
    }
}

fn is_storage_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}
