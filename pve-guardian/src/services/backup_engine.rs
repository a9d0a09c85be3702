//! Backup job: dump guests on the host, pull the archives, apply local
//! retention and replicate offsite.
//!
//! A job makes up to `retry_count + 1` attempts and always ends in exactly
//! one history entry and one notification, whatever happened.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;

use super::coordinator::Rejection;
use super::host::{list_guests, running_processes};
use super::notifier::Notification;
use super::retention;
use crate::config::{AppConfig, BackupConfig, ConfigError};
use crate::models::artifact::{extract_vmid, is_safe_filename};
use crate::models::history::{self, HistoryEntry, HistoryKind};
use crate::remote::{RemoteError, RemoteSession, SshTarget};
use crate::state::AppState;
use crate::transfer::progress::format_duration;
use crate::transfer::{format_bytes, throttled};

/// Where vzdump writes when it announces a relative path
pub const DEFAULT_DUMP_DIR: &str = "/var/lib/vz/dump";

const SFTP_PROGRESS_STEP: u32 = 20;
const OFFSITE_PROGRESS_STEP: u32 = 10;
const CONTROL_MESSAGE_ERROR: &str = "got unexpected control message";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("cannot prepare local backup directory {path}: {source}")]
    LocalDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("SSH connection failed: {0}")]
    Connect(#[source] RemoteError),

    #[error("skipped: a vzdump job is already running on the host")]
    Collision { processes: Vec<String> },

    #[error("no VM/container found on the host")]
    NoGuests,

    #[error("interrupted, possibly externally paused: vzdump is still running on the host")]
    InterruptedPaused,

    #[error("interrupted: connection dropped or job killed")]
    Interrupted,

    #[error("dump command failed: {stderr}")]
    DumpFailed { status: Option<i32>, stderr: String },

    #[error("no archive announced in dump output")]
    NoArchiveAnnounced,

    #[error("all downloads failed: {0}")]
    DownloadsFailed(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl BackupError {
    /// Configuration problems fail the job at once; everything else gets
    /// another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackupError::Config(_) | BackupError::LocalDir { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum OffsiteStatus {
    Disabled,
    Uploaded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub remote_path: String,
    pub vmid: Option<String>,
    pub size: u64,
    pub local_path: Option<PathBuf>,
    pub error: Option<String>,
    pub offsite: OffsiteStatus,
}

impl FileReport {
    fn new(remote_path: String) -> Self {
        let filename = remote_path
            .rsplit('/')
            .next()
            .unwrap_or(remote_path.as_str())
            .to_string();
        Self {
            vmid: extract_vmid(&filename),
            filename,
            remote_path,
            size: 0,
            local_path: None,
            error: None,
            offsite: OffsiteStatus::Disabled,
        }
    }

    pub fn downloaded(&self) -> bool {
        self.error.is_none() && self.local_path.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub success: bool,
    pub attempts: u32,
    pub message: String,
    pub files: Vec<FileReport>,
    pub duration_secs: u64,
}

#[derive(Debug)]
pub enum BackupOutcome {
    Rejected(Rejection),
    Finished(BackupReport),
}

fn archive_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"creating (?:vzdump )?archive '(.+)'").expect("valid archive regex"))
}

/// Archive path announced on one line of vzdump output.
pub fn parse_archive_line(line: &str) -> Option<String> {
    archive_pattern().captures(line).map(|c| c[1].to_string())
}

/// Comma- or whitespace-separated VMIDs, each all digits.
pub fn parse_vmid_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|id| {
            if id.chars().all(|c| c.is_ascii_digit()) {
                Ok(id.to_string())
            } else {
                Err(ConfigError::Invalid(format!("invalid VMID '{id}' in backup list")))
            }
        })
        .collect()
}

pub fn dump_command(vmids: &[String], config: &BackupConfig) -> String {
    format!(
        "vzdump {} --compress {} --mode {} --storage {}",
        vmids.join(" "),
        config.compress.as_str(),
        config.mode.as_str(),
        config.storage
    )
}

fn absolute_dump_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{DEFAULT_DUMP_DIR}/{path}")
    }
}

/// Run one backup job. Never blocks on the task slot: a busy slot drops
/// the trigger.
pub fn run_backup_job(state: &AppState) -> BackupOutcome {
    let _guard = match state.coordinator.try_begin_backup() {
        Ok(guard) => guard,
        Err(reason) => {
            tracing::info!(reason = %reason, "[Backup] Trigger dropped");
            return BackupOutcome::Rejected(reason);
        }
    };

    let started = Instant::now();
    let config = &state.config;
    tracing::info!("[Backup] Job started");

    let (result, attempts) = match precheck(config) {
        Ok(local_dir) => run_attempts(state, &local_dir),
        Err(e) => (Err(e), 0),
    };

    let report = match result {
        Ok(files) => BackupReport {
            success: true,
            attempts,
            message: summarize(&files),
            files,
            duration_secs: started.elapsed().as_secs(),
        },
        Err(e) => BackupReport {
            success: false,
            attempts,
            message: format!("backup failed: {e}"),
            files: Vec::new(),
            duration_secs: started.elapsed().as_secs(),
        },
    };

    let filenames: Vec<String> = report
        .files
        .iter()
        .filter(|f| f.downloaded())
        .map(|f| f.filename.clone())
        .collect();

    if report.success {
        if let Some(last) = filenames.last() {
            state.coordinator.record_backup_success(last.clone());
        }
        tracing::info!(attempts, "[Backup] {} (took {})", report.message, format_duration(report.duration_secs));
    } else {
        tracing::error!(attempts, "[Backup] {} (took {})", report.message, format_duration(report.duration_secs));
    }

    let mut entry = HistoryEntry::new(HistoryKind::Backup, report.success, report.message.clone());
    entry.filenames = filenames.clone();
    entry.duration_secs = report.duration_secs;
    if let Err(e) = history::append(&state.store, entry) {
        tracing::error!(error = %e, "[Backup] Failed to record history");
    }

    let mut notification = Notification::new(HistoryKind::Backup, report.success, report.message.clone());
    notification.filenames = filenames;
    state.notifier.notify(&notification);

    BackupOutcome::Finished(report)
}

fn precheck(config: &AppConfig) -> Result<PathBuf, BackupError> {
    config.validate_credentials()?;
    config.validate()?;
    parse_vmid_list(&config.backup.vmids)?;

    let local_dir = config.local_dir();
    std::fs::create_dir_all(&local_dir).map_err(|source| BackupError::LocalDir {
        path: local_dir.clone(),
        source,
    })?;
    Ok(local_dir)
}

fn run_attempts(state: &AppState, local_dir: &Path) -> (Result<Vec<FileReport>, BackupError>, u32) {
    let total = state.config.schedule.retry_count + 1;
    let interval = Duration::from_secs(state.config.schedule.retry_interval_secs);
    let mut attempt = 0;

    loop {
        attempt += 1;
        tracing::info!(attempt, total, "[Backup] Starting attempt");

        let err = match perform_backup(state, local_dir) {
            Ok(files) => return (Ok(files), attempt),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= total {
            return (Err(err), attempt);
        }
        tracing::warn!(attempt, total, error = %err, "[Backup] Attempt failed, retrying in {}s", interval.as_secs());
        state
            .coordinator
            .set_backup_activity(format!("attempt {attempt}/{total} failed, retrying"));
        thread::sleep(interval);
    }
}

fn perform_backup(state: &AppState, local_dir: &Path) -> Result<Vec<FileReport>, BackupError> {
    let config = &state.config;
    let coordinator = &state.coordinator;

    let target = SshTarget::from_config(&config.ssh)?;
    coordinator.set_backup_activity(format!("connecting to {}", target.host));
    let mut session = state.connector.connect(&target).map_err(BackupError::Connect)?;

    let running = running_processes(session.as_mut(), "vzdump")?;
    if !running.is_empty() {
        return Err(BackupError::Collision { processes: running });
    }

    let vmids = match parse_vmid_list(&config.backup.vmids)? {
        ids if !ids.is_empty() => ids,
        _ => {
            let guests: Vec<String> = list_guests(session.as_mut())?.into_values().map(|(id, _)| id).collect();
            if guests.is_empty() {
                return Err(BackupError::NoGuests);
            }
            tracing::info!(vmids = %guests.join(","), "[Backup] No VMIDs configured, backing up every guest");
            guests
        }
    };

    let command = dump_command(&vmids, &config.backup);
    coordinator.set_backup_activity(format!("dumping VMID {}", vmids.join(", ")));
    let archives = run_dump(session.as_mut(), &command)?;

    let selected: Vec<String> = if config.backup.download_all {
        archives
    } else {
        archives.into_iter().last().into_iter().collect()
    };

    let mut files: Vec<FileReport> = selected
        .into_iter()
        .map(|path| download_archive(state, session.as_mut(), absolute_dump_path(&path), local_dir))
        .collect();
    drop(session);

    if !files.iter().any(FileReport::downloaded) {
        let reasons: Vec<String> = files
            .iter()
            .map(|f| format!("{}: {}", f.filename, f.error.as_deref().unwrap_or("unknown error")))
            .collect();
        return Err(BackupError::DownloadsFailed(reasons.join("; ")));
    }

    if config.local.enabled {
        coordinator.set_backup_activity("applying local retention");
        match retention::cleanup_local(local_dir, config.local.keep) {
            Ok(report) => tracing::info!(kept = report.kept, deleted = report.deleted.len(), "[Backup] Local retention done"),
            Err(e) => tracing::warn!(error = %e, "[Backup] Local retention failed"),
        }
    }

    if config.offsite.enabled {
        replicate_offsite(state, &mut files);
    }

    Ok(files)
}

/// Stream the dump and collect announced archive paths in order.
fn run_dump(session: &mut dyn RemoteSession, command: &str) -> Result<Vec<String>, BackupError> {
    tracing::info!(command, "[Backup] Running dump");
    let mut archives = Vec::new();

    let exit = {
        let mut output = session.execute(command)?;
        let mut stream_error = None;
        for line in output.by_ref() {
            match line {
                Ok(line) => {
                    tracing::info!("[vzdump] {line}");
                    if let Some(path) = parse_archive_line(&line) {
                        archives.push(path);
                    }
                }
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }
        match stream_error {
            Some(e) => {
                tracing::warn!(error = %e, "[Backup] Dump output stream broke");
                None
            }
            None => Some(output.finish()?),
        }
    };

    let exit = match exit {
        Some(exit) if exit.success() => {
            if archives.is_empty() {
                return Err(BackupError::NoArchiveAnnounced);
            }
            return Ok(archives);
        }
        Some(exit) => exit,
        None => return Err(classify_interruption(session)),
    };

    if exit.status.is_none() || exit.status == Some(-1) || exit.stderr.contains(CONTROL_MESSAGE_ERROR) {
        return Err(classify_interruption(session));
    }
    Err(BackupError::DumpFailed {
        status: exit.status,
        stderr: exit.stderr,
    })
}

fn classify_interruption(session: &mut dyn RemoteSession) -> BackupError {
    match running_processes(session, "vzdump") {
        Ok(processes) if !processes.is_empty() => BackupError::InterruptedPaused,
        _ => BackupError::Interrupted,
    }
}

fn download_archive(state: &AppState, session: &mut dyn RemoteSession, remote_path: String, local_dir: &Path) -> FileReport {
    let mut report = FileReport::new(remote_path);
    let filename = report.filename.clone();

    if !is_safe_filename(&filename) {
        report.error = Some(format!("refusing unexpected archive name '{filename}'"));
        return report;
    }

    match session.stat(&report.remote_path) {
        Ok(size) => report.size = size,
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "[Backup] Announced archive is missing on the host");
            report.error = Some(format!("remote archive missing: {e}"));
            return report;
        }
    }

    tracing::info!(file = %filename, size = %format_bytes(report.size), "[Backup] Downloading archive");
    let local_path = local_dir.join(&filename);
    let coordinator = state.coordinator.clone();
    let label = filename.clone();
    let progress = throttled(SFTP_PROGRESS_STEP, move |percent, done, total| {
        coordinator.set_backup_activity(format!("downloading {label}: {percent:.0}%"));
        tracing::info!(file = %label, "[Backup] Download {:.1}% ({} / {})", percent, format_bytes(done), format_bytes(total));
    });

    match session.download(&report.remote_path, &local_path, &mut |done, total| progress(done, total)) {
        Ok(_) => {
            report.local_path = Some(local_path);
            if state.config.backup.auto_delete_after_download {
                match session.remove(&report.remote_path) {
                    Ok(()) => tracing::info!(file = %filename, "[Backup] Removed archive from host"),
                    Err(e) => tracing::warn!(file = %filename, error = %e, "[Backup] Could not remove archive from host"),
                }
            }
        }
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "[Backup] Download failed");
            report.error = Some(e.to_string());
        }
    }
    report
}

fn replicate_offsite(state: &AppState, files: &mut [FileReport]) {
    let config = &state.config;
    let coordinator = &state.coordinator;
    coordinator.set_backup_activity("connecting to offsite storage");

    let store = match state.offsite.open() {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "[Backup] Offsite storage unavailable");
            for file in files.iter_mut().filter(|f| f.downloaded()) {
                file.offsite = OffsiteStatus::Failed(e.to_string());
            }
            return;
        }
    };
    if let Err(e) = store.ensure_directory() {
        tracing::warn!(error = %e, "[Backup] Could not create offsite directory, uploading anyway");
    }

    for file in files.iter_mut().filter(|f| f.downloaded()) {
        let Some(local_path) = file.local_path.clone() else {
            continue;
        };
        let shared = state.coordinator.clone();
        let label = file.filename.clone();
        let progress = throttled(OFFSITE_PROGRESS_STEP, move |percent, done, total| {
            shared.set_backup_activity(format!("uploading {label} offsite: {percent:.0}%"));
            tracing::info!(file = %label, "[Backup] Offsite upload {:.1}% ({} / {})", percent, format_bytes(done), format_bytes(total));
        });

        file.offsite = match store.upload(&local_path, &file.filename, progress) {
            Ok(()) => OffsiteStatus::Uploaded,
            Err(e) => {
                tracing::warn!(file = %file.filename, error = %e, "[Backup] Offsite upload failed");
                OffsiteStatus::Failed(e.to_string())
            }
        };

        if !config.local.enabled && file.offsite == OffsiteStatus::Uploaded {
            match std::fs::remove_file(&local_path) {
                Ok(()) => tracing::info!(file = %file.filename, "[Backup] Removed local staging copy"),
                Err(e) => tracing::warn!(file = %file.filename, error = %e, "[Backup] Could not remove staging copy"),
            }
        }
    }

    coordinator.set_backup_activity("applying offsite retention");
    match retention::cleanup_offsite(store.as_ref(), config.offsite.keep) {
        Ok(report) => tracing::info!(kept = report.kept, deleted = report.deleted.len(), "[Backup] Offsite retention done"),
        Err(e) => tracing::warn!(error = %e, "[Backup] Offsite retention failed"),
    }
}

fn summarize(files: &[FileReport]) -> String {
    let downloaded: Vec<&FileReport> = files.iter().filter(|f| f.downloaded()).collect();

    let mut vmids: Vec<&str> = Vec::new();
    for vmid in downloaded.iter().filter_map(|f| f.vmid.as_deref()) {
        if !vmids.contains(&vmid) {
            vmids.push(vmid);
        }
    }
    let names: Vec<&str> = downloaded.iter().map(|f| f.filename.as_str()).collect();

    let mut message = format!("backup succeeded [VMID: {}]: {}", vmids.join(", "), names.join(", "));

    let failed: Vec<String> = files
        .iter()
        .filter_map(|f| f.error.as_ref().map(|e| format!("{} ({e})", f.filename)))
        .collect();
    if !failed.is_empty() {
        message.push_str(&format!("; {} download(s) failed: {}", failed.len(), failed.join(", ")));
    }

    let offsite_failed: Vec<String> = files
        .iter()
        .filter_map(|f| match &f.offsite {
            OffsiteStatus::Failed(e) => Some(format!("{} ({e})", f.filename)),
            _ => None,
        })
        .collect();
    if !offsite_failed.is_empty() {
        message.push_str(&format!("; offsite upload failed: {}", offsite_failed.join(", ")));
    }
    message
}
