//! Offsite replication targets.
//!
//! [`OffsiteProvider::open`] resolves a working endpoint once per task and
//! hands back an [`OffsiteStore`] bound to it. Stores are blocking.

pub mod digest;
pub mod propfind;
pub mod webdav;

#[cfg(test)]
pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

use crate::transfer::ProgressCallback;

pub use webdav::{WebDavClient, WebDavProvider};

#[derive(Debug, Error)]
pub enum OffsiteError {
    #[error("invalid offsite URL '{0}'")]
    InvalidUrl(String),

    #[error("offsite storage is not configured")]
    NotConfigured,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no usable WebDAV endpoint: {0}")]
    Discovery(String),

    #[error("{method} {url} returned HTTP {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },

    #[error("offsite storage is full (HTTP 507)")]
    InsufficientStorage,

    #[error("invalid PROPFIND response: {0}")]
    Xml(String),

    #[error("upload of {name} rejected: {attempts}")]
    UploadRejected { name: String, attempts: String },
}

/// A file in the offsite collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

pub trait OffsiteStore: Send {
    /// Create the configured collection path if missing.
    fn ensure_directory(&self) -> Result<(), OffsiteError>;

    fn upload(&self, local: &Path, name: &str, on_progress: ProgressCallback) -> Result<(), OffsiteError>;

    /// Stream `name` into `local`. Returns bytes written.
    fn download(&self, name: &str, local: &Path, on_progress: ProgressCallback) -> Result<u64, OffsiteError>;

    /// Backup archives in the collection; sub-collections are skipped.
    fn list(&self) -> Result<Vec<RemoteEntry>, OffsiteError>;

    /// Deleting a missing file succeeds.
    fn delete(&self, name: &str) -> Result<(), OffsiteError>;
}

pub trait OffsiteProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn OffsiteStore>, OffsiteError>;
}
