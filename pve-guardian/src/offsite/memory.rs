//! In-memory offsite store for engine tests.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{OffsiteError, OffsiteProvider, OffsiteStore, RemoteEntry};
use crate::transfer::ProgressCallback;

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, (Vec<u8>, Option<DateTime<Utc>>)>,
    unreachable: bool,
    full: bool,
    uploads: usize,
}

/// Clones share one bucket.
#[derive(Clone, Default)]
pub struct MemoryOffsite {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryOffsite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, content: &[u8], modified: Option<DateTime<Utc>>) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(name.to_string(), (content.to_vec(), modified));
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_full(&self, full: bool) {
        self.inner.lock().unwrap().full = full;
    }

    pub fn uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads
    }
}

impl OffsiteProvider for MemoryOffsite {
    fn open(&self) -> Result<Box<dyn OffsiteStore>, OffsiteError> {
        if self.inner.lock().unwrap().unreachable {
            return Err(OffsiteError::Discovery("connection refused".into()));
        }
        Ok(Box::new(self.clone()))
    }
}

impl OffsiteStore for MemoryOffsite {
    fn ensure_directory(&self) -> Result<(), OffsiteError> {
        Ok(())
    }

    fn upload(&self, local: &Path, name: &str, on_progress: ProgressCallback) -> Result<(), OffsiteError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.full {
            return Err(OffsiteError::InsufficientStorage);
        }
        let content = std::fs::read(local)?;
        on_progress(content.len() as u64, content.len() as u64);
        inner.uploads += 1;
        inner.files.insert(name.to_string(), (content, Some(Utc::now())));
        Ok(())
    }

    fn download(&self, name: &str, local: &Path, on_progress: ProgressCallback) -> Result<u64, OffsiteError> {
        let content = self
            .inner
            .lock()
            .unwrap()
            .files
            .get(name)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| OffsiteError::Status {
                method: "GET".into(),
                url: name.to_string(),
                status: 404,
            })?;
        std::fs::write(local, &content)?;
        on_progress(content.len() as u64, content.len() as u64);
        Ok(content.len() as u64)
    }

    fn list(&self) -> Result<Vec<RemoteEntry>, OffsiteError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .files
            .iter()
            .map(|(name, (content, modified))| RemoteEntry {
                name: name.clone(),
                size: Some(content.len() as u64),
                modified: *modified,
            })
            .collect())
    }

    fn delete(&self, name: &str) -> Result<(), OffsiteError> {
        self.inner.lock().unwrap().files.remove(name);
        Ok(())
    }
}
