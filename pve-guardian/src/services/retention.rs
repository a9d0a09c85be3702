//! Keep-N retention for local and offsite archives.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use crate::models::artifact::{filename_timestamp, scan_local_dir, ArtifactLocation};
use crate::offsite::{OffsiteError, OffsiteStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Everything beyond the `keep` most recent items, newest first.
/// `keep == 0` disables retention. Items without a time sort as newest.
pub fn select_expired<T>(mut items: Vec<T>, keep: usize, time_of: impl Fn(&T) -> Option<DateTime<Utc>>) -> Vec<T> {
    if keep == 0 || items.len() <= keep {
        return Vec::new();
    }
    items.sort_by(|a, b| match (time_of(a), time_of(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    items.split_off(keep)
}

pub fn cleanup_local(dir: &Path, keep: usize) -> std::io::Result<RetentionReport> {
    let artifacts = scan_local_dir(dir)?;
    let total = artifacts.len();
    let expired = select_expired(artifacts, keep, |a| a.effective_time());

    let mut report = RetentionReport {
        kept: total - expired.len(),
        ..Default::default()
    };
    for artifact in expired {
        let ArtifactLocation::Local(path) = &artifact.location else {
            continue;
        };
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(file = %artifact.filename, "[Retention] Removed local archive");
                report.deleted.push(artifact.filename);
            }
            Err(e) => {
                tracing::warn!(file = %artifact.filename, error = %e, "[Retention] Failed to remove local archive");
                report.failed.push((artifact.filename, e.to_string()));
            }
        }
    }
    Ok(report)
}

pub fn cleanup_offsite(store: &dyn OffsiteStore, keep: usize) -> Result<RetentionReport, OffsiteError> {
    if keep == 0 {
        return Ok(RetentionReport::default());
    }
    let entries = store.list()?;
    let total = entries.len();
    let expired = select_expired(entries, keep, |e| filename_timestamp(&e.name).or(e.modified));

    let mut report = RetentionReport {
        kept: total - expired.len(),
        ..Default::default()
    };
    for entry in expired {
        match store.delete(&entry.name) {
            Ok(()) => {
                tracing::info!(file = %entry.name, "[Retention] Removed offsite archive");
                report.deleted.push(entry.name);
            }
            Err(e) => {
                tracing::warn!(file = %entry.name, error = %e, "[Retention] Failed to remove offsite archive");
                report.failed.push((entry.name, e.to_string()));
            }
        }
    }
    Ok(report)
}
