//! Progress reporting for archive transfers.
//!
//! Transfers report raw byte counts; [`ProgressThrottle`] turns them into
//! coarse percentage milestones so logs and the activity board only see a
//! handful of updates per file.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Chunk size for streamed copies
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Shared progress callback: `(transferred, total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Emits a percentage whenever a transfer crosses into a new bucket.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: u32,
    last_bucket: Option<u32>,
}

impl ProgressThrottle {
    /// `step_percent` is the bucket width, e.g. 20 for 0/20/40/60/80/100.
    pub fn new(step_percent: u32) -> Self {
        Self {
            step: step_percent.clamp(1, 100),
            last_bucket: None,
        }
    }

    /// Returns the exact percentage when a new bucket is reached.
    pub fn update(&mut self, transferred: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        let percent = (transferred.min(total) as f64 / total as f64) * 100.0;
        let bucket = (percent as u32 / self.step) * self.step;
        match self.last_bucket {
            Some(last) if bucket <= last => None,
            _ => {
                self.last_bucket = Some(bucket);
                Some(percent)
            }
        }
    }
}

/// Wrap `report(percent, transferred, total)` so it only fires on bucket
/// changes.
pub fn throttled<F>(step_percent: u32, report: F) -> ProgressCallback
where
    F: Fn(f64, u64, u64) + Send + Sync + 'static,
{
    let throttle = Mutex::new(ProgressThrottle::new(step_percent));
    Arc::new(move |transferred, total| {
        let hit = throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(transferred, total);
        if let Some(percent) = hit {
            report(percent, transferred, total);
        }
    })
}

/// Copy `reader` into `writer` in [`CHUNK_SIZE`] chunks, reporting the
/// running byte count after every chunk.
pub fn copy_with_progress<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    on_progress: &mut dyn FnMut(u64, u64),
) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        transferred += n as u64;
        on_progress(transferred, total);
    }

    writer.flush()?;
    Ok(transferred)
}

/// Reader wrapper that reports bytes pulled through it.
pub struct ProgressReader<R> {
    inner: R,
    total: u64,
    transferred: u64,
    callback: ProgressCallback,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, total: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            total,
            transferred: 0,
            callback,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.transferred += n as u64;
            (self.callback)(self.transferred, self.total);
        }
        Ok(n)
    }
}

/// Temporary name a download is written to before the final rename.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}
