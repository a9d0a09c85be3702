//! Bounded backup and restore history, newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactSource;
use super::settings::{KvStore, KEY_BACKUP_HISTORY, KEY_RESTORE_HISTORY};

pub const BACKUP_HISTORY_CAPACITY: usize = 100;
pub const RESTORE_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Backup,
    Restore,
}

impl HistoryKind {
    fn key(&self) -> &'static str {
        match self {
            HistoryKind::Backup => KEY_BACKUP_HISTORY,
            HistoryKind::Restore => KEY_RESTORE_HISTORY,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            HistoryKind::Backup => BACKUP_HISTORY_CAPACITY,
            HistoryKind::Restore => RESTORE_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: HistoryKind,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub filenames: Vec<String>,
    /// Restore target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtifactSource>,
    #[serde(default)]
    pub duration_secs: u64,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, success: bool, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            success,
            message: message.into(),
            filenames: Vec::new(),
            vmid: None,
            source: None,
            duration_secs: 0,
        }
    }
}

/// Prepend `entry`, dropping the oldest records beyond the kind's capacity.
pub fn append(store: &KvStore, entry: HistoryEntry) -> anyhow::Result<()> {
    let kind = entry.kind;
    store.update(kind.key(), |entries: &mut Vec<HistoryEntry>| {
        entries.insert(0, entry);
        entries.truncate(kind.capacity());
    })?;
    Ok(())
}

pub fn list(store: &KvStore, kind: HistoryKind) -> anyhow::Result<Vec<HistoryEntry>> {
    Ok(store.get(kind.key())?.unwrap_or_default())
}

/// Both histories merged, newest first.
pub fn list_all(store: &KvStore, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
    let mut entries = list(store, HistoryKind::Backup)?;
    entries.extend(list(store, HistoryKind::Restore)?);
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries.truncate(limit);
    Ok(entries)
}

pub fn clear(store: &KvStore, kind: Option<HistoryKind>) -> anyhow::Result<()> {
    match kind {
        Some(kind) => store.delete(kind.key()),
        None => {
            store.delete(HistoryKind::Backup.key())?;
            store.delete(HistoryKind::Restore.key())
        }
    }
}
