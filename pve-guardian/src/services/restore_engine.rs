//! Restore job: stage an archive on the host and restore it with `qmrestore`
//! or `pct restore`.
//!
//! An existing guest with the target VMID is only destroyed after the
//! archive has reached the host, so a failed transfer never costs a guest.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::coordinator::Rejection;
use super::host::find_guest;
use super::notifier::Notification;
use crate::config::{AppConfig, ConfigError};
use crate::models::artifact::{extract_vmid, is_backup_archive, is_safe_filename, ArtifactSource, GuestKind};
use crate::models::history::{self, HistoryEntry, HistoryKind};
use crate::offsite::OffsiteError;
use crate::remote::{RemoteError, RemoteSession, SshTarget};
use crate::state::AppState;
use crate::transfer::progress::format_duration;
use crate::transfer::{format_bytes, throttled};

const TRANSFER_PROGRESS_STEP: u32 = 20;

/// Why a restore request never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RestoreRefusal {
    #[error("restore is disabled in the configuration")]
    Disabled,

    #[error("{0}")]
    Busy(Rejection),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("invalid archive name '{0}'")]
    InvalidFilename(String),

    #[error("cannot determine target VMID for '{0}'")]
    NoVmid(String),

    #[error("invalid target VMID '{0}'")]
    InvalidVmid(String),

    #[error("cannot tell whether '{0}' is a VM or container archive")]
    UnknownKind(String),

    #[error("local archive not found: {0}")]
    MissingArchive(PathBuf),

    #[error("skipped: VMID {vmid} already exists")]
    SkippedExisting { vmid: String },

    #[error("VMID {vmid} already exists and force is not enabled")]
    Exists { vmid: String },

    #[error("offsite download failed: {0}")]
    Offsite(#[from] OffsiteError),

    #[error("SSH connection failed: {0}")]
    Connect(#[source] RemoteError),

    #[error("upload to host failed: {0}")]
    Upload(#[source] RemoteError),

    #[error("could not remove existing guest {vmid}: {stderr}")]
    DestroyFailed { vmid: String, stderr: String },

    #[error("restore command failed: {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },

    #[error("interrupted: connection dropped during restore")]
    Interrupted,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    /// Failures detected before anything touched the host.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RestoreError::Config(_)
                | RestoreError::InvalidFilename(_)
                | RestoreError::NoVmid(_)
                | RestoreError::InvalidVmid(_)
                | RestoreError::UnknownKind(_)
                | RestoreError::MissingArchive(_)
                | RestoreError::SkippedExisting { .. }
                | RestoreError::Exists { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub vmid: Option<String>,
    pub duration_secs: u64,
}

/// What a restore will do, resolved before any transfer.
#[derive(Debug, Clone)]
struct RestorePlan {
    filename: String,
    source: ArtifactSource,
    vmid: String,
    kind: GuestKind,
    scratch_path: String,
}

/// Local file removed when dropped.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::debug!(path = %self.0.display(), "[Restore] Removed scratch copy"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "[Restore] Could not remove scratch copy"),
        }
    }
}

pub fn restore_command(kind: GuestKind, vmid: &str, path: &str, storage: &str) -> String {
    let mut command = match kind {
        GuestKind::Container => format!("pct restore {vmid} {path}"),
        GuestKind::Vm => format!("qmrestore {path} {vmid}"),
    };
    if !storage.is_empty() {
        command.push_str(&format!(" --storage {storage}"));
    }
    command
}

fn scratch_path(dir: &str, filename: &str) -> String {
    format!("{}/{filename}", dir.trim_end_matches('/'))
}

fn plan(config: &AppConfig, filename: &str, source: ArtifactSource) -> Result<RestorePlan, RestoreError> {
    if !is_safe_filename(filename) || !is_backup_archive(filename) {
        return Err(RestoreError::InvalidFilename(filename.to_string()));
    }
    config.validate_credentials()?;
    config.validate()?;

    let vmid = match config.restore.vmid.trim() {
        "" => extract_vmid(filename).ok_or_else(|| RestoreError::NoVmid(filename.to_string()))?,
        id => id.to_string(),
    };
    if vmid.is_empty() || !vmid.chars().all(|c| c.is_ascii_digit()) {
        return Err(RestoreError::InvalidVmid(vmid));
    }
    let kind = GuestKind::from_filename(filename).ok_or_else(|| RestoreError::UnknownKind(filename.to_string()))?;

    Ok(RestorePlan {
        filename: filename.to_string(),
        source,
        vmid,
        kind,
        scratch_path: scratch_path(&config.restore.remote_scratch_dir, filename),
    })
}

/// Run one restore. Refused without waiting when restores are disabled or
/// the task slot is taken.
pub fn run_restore_job(state: &AppState, filename: &str, source: ArtifactSource) -> Result<RestoreOutcome, RestoreRefusal> {
    if !state.config.restore.enabled {
        tracing::warn!(file = %filename, "[Restore] Request refused: restore disabled");
        return Err(RestoreRefusal::Disabled);
    }
    let _guard = state.coordinator.try_begin_restore().map_err(|reason| {
        tracing::warn!(file = %filename, reason = %reason, "[Restore] Request refused");
        RestoreRefusal::Busy(reason)
    })?;

    let started = Instant::now();
    tracing::info!(file = %filename, source = source.as_str(), "[Restore] Job started");

    let planned = plan(&state.config, filename, source);
    let vmid = planned.as_ref().ok().map(|p| p.vmid.clone());
    let result = planned.and_then(|p| perform_restore(state, &p));
    let duration_secs = started.elapsed().as_secs();

    let (success, message, error) = match &result {
        Ok(()) => (
            true,
            format!(
                "restore succeeded: {filename} -> VMID {}",
                vmid.as_deref().unwrap_or("?")
            ),
            None,
        ),
        Err(e) => {
            if e.is_precondition() {
                tracing::warn!(file = %filename, error = %e, "[Restore] Not restored");
            } else {
                tracing::error!(file = %filename, error = %e, "[Restore] Failed");
            }
            (false, format!("restore failed: {e}"), Some(e.to_string()))
        }
    };
    if success {
        tracing::info!(file = %filename, "[Restore] {message} (took {})", format_duration(duration_secs));
    }

    let mut entry = HistoryEntry::new(HistoryKind::Restore, success, message.clone());
    entry.filenames = vec![filename.to_string()];
    entry.vmid = vmid.clone();
    entry.source = Some(source);
    entry.duration_secs = duration_secs;
    if let Err(e) = history::append(&state.store, entry) {
        tracing::error!(error = %e, "[Restore] Failed to record history");
    }

    let mut notification = Notification::new(HistoryKind::Restore, success, message);
    notification.filenames = vec![filename.to_string()];
    state.notifier.notify(&notification);

    Ok(RestoreOutcome {
        success,
        error,
        vmid,
        duration_secs,
    })
}

fn perform_restore(state: &AppState, plan: &RestorePlan) -> Result<(), RestoreError> {
    let config = &state.config;
    let coordinator = &state.coordinator;

    let (local_path, _scratch) = match plan.source {
        ArtifactSource::Local => {
            let path = config.local_dir().join(&plan.filename);
            if !path.is_file() {
                return Err(RestoreError::MissingArchive(path));
            }
            (path, None)
        }
        ArtifactSource::Offsite => {
            let path = fetch_offsite(state, plan)?;
            (path.0.clone(), Some(path))
        }
    };

    let target = SshTarget::from_config(&config.ssh)?;
    coordinator.set_restore_activity(format!("connecting to {}", target.host));
    let mut session = state.connector.connect(&target).map_err(RestoreError::Connect)?;

    let existing = find_guest(session.as_mut(), &plan.vmid)?;
    if existing.is_some() {
        if config.restore.skip_existing {
            return Err(RestoreError::SkippedExisting { vmid: plan.vmid.clone() });
        }
        if !config.restore.force {
            return Err(RestoreError::Exists { vmid: plan.vmid.clone() });
        }
    }

    upload_archive(state, session.as_mut(), &local_path, plan)?;

    let result = replace_and_restore(state, session.as_mut(), plan, existing);

    match session.remove(&plan.scratch_path) {
        Ok(()) => tracing::debug!(path = %plan.scratch_path, "[Restore] Removed remote scratch copy"),
        Err(e) => tracing::warn!(path = %plan.scratch_path, error = %e, "[Restore] Could not remove remote scratch copy"),
    }
    result
}

fn fetch_offsite(state: &AppState, plan: &RestorePlan) -> Result<ScratchFile, RestoreError> {
    let temp_dir = state.config.temp_dir();
    std::fs::create_dir_all(&temp_dir)?;
    let scratch = ScratchFile(temp_dir.join(&plan.filename));

    state.coordinator.set_restore_activity("connecting to offsite storage");
    let store = state.offsite.open()?;

    let coordinator = state.coordinator.clone();
    let label = plan.filename.clone();
    let progress = throttled(TRANSFER_PROGRESS_STEP, move |percent, done, total| {
        coordinator.set_restore_activity(format!("downloading {label} from offsite: {percent:.0}%"));
        tracing::info!(file = %label, "[Restore] Offsite download {:.1}% ({} / {})", percent, format_bytes(done), format_bytes(total));
    });
    let bytes = store.download(&plan.filename, &scratch.0, progress)?;
    tracing::info!(file = %plan.filename, size = %format_bytes(bytes), "[Restore] Fetched archive from offsite");
    Ok(scratch)
}

fn upload_archive(
    state: &AppState,
    session: &mut dyn RemoteSession,
    local_path: &Path,
    plan: &RestorePlan,
) -> Result<(), RestoreError> {
    let coordinator = state.coordinator.clone();
    let label = plan.filename.clone();
    let progress = throttled(TRANSFER_PROGRESS_STEP, move |percent, done, total| {
        coordinator.set_restore_activity(format!("uploading {label} to host: {percent:.0}%"));
        tracing::info!(file = %label, "[Restore] Upload {:.1}% ({} / {})", percent, format_bytes(done), format_bytes(total));
    });

    let bytes = session
        .upload(local_path, &plan.scratch_path, &mut |done, total| progress(done, total))
        .map_err(RestoreError::Upload)?;
    tracing::info!(path = %plan.scratch_path, size = %format_bytes(bytes), "[Restore] Archive staged on host");
    Ok(())
}

fn replace_and_restore(
    state: &AppState,
    session: &mut dyn RemoteSession,
    plan: &RestorePlan,
    existing: Option<GuestKind>,
) -> Result<(), RestoreError> {
    let config = &state.config.restore;

    if let Some(kind) = existing {
        state
            .coordinator
            .set_restore_activity(format!("removing existing guest {}", plan.vmid));
        let stop = session.run(&format!("{} stop {}", kind.cli(), plan.vmid))?;
        if !stop.exit.success() {
            tracing::debug!(vmid = %plan.vmid, stderr = %stop.exit.stderr, "[Restore] Stop reported an error");
        }
        thread::sleep(Duration::from_secs(config.stop_grace_secs));

        let destroy = session.run(&format!("{} destroy {}", kind.cli(), plan.vmid))?;
        if !destroy.exit.success() && !destroy.exit.stderr.contains("does not exist") {
            return Err(RestoreError::DestroyFailed {
                vmid: plan.vmid.clone(),
                stderr: destroy.exit.stderr,
            });
        }
        tracing::info!(vmid = %plan.vmid, "[Restore] Existing guest removed");
    }

    let command = restore_command(plan.kind, &plan.vmid, &plan.scratch_path, &config.storage);
    state
        .coordinator
        .set_restore_activity(format!("restoring {} to VMID {}", plan.filename, plan.vmid));
    tracing::info!(command = %command, "[Restore] Running restore");

    let mut output = session.execute(&command)?;
    for line in output.by_ref() {
        match line {
            Ok(line) => tracing::info!("[restore] {line}"),
            Err(e) => {
                tracing::warn!(error = %e, "[Restore] Output stream broke");
                return Err(RestoreError::Interrupted);
            }
        }
    }
    let exit = output.finish()?;
    if !exit.success() {
        return Err(RestoreError::CommandFailed {
            status: exit.status,
            stderr: exit.stderr,
        });
    }
    Ok(())
}
