//! Backup archives and the metadata encoded in their file names.
//!
//! vzdump names its output `vzdump-<qemu|lxc>-<vmid>-<timestamp>.<vma|tar>[.<zst|gz|lzo>]`.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".vma", ".vma.zst", ".vma.gz", ".vma.lzo", ".tar", ".tar.zst", ".tar.gz", ".tar.lzo",
];

fn guest_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"vzdump-(qemu|lxc)-(\d+)-").expect("valid guest regex"))
}

fn timestamp_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[-_])(\d{4})_?(\d{2})_?(\d{2})[-_]?(\d{2})_?(\d{2})_?(\d{2})(?:\D|$)")
            .expect("valid timestamp regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Vm,
    Container,
}

impl GuestKind {
    /// Management CLI on the host (`qm` or `pct`)
    pub fn cli(&self) -> &'static str {
        match self {
            GuestKind::Vm => "qm",
            GuestKind::Container => "pct",
        }
    }

    pub fn from_filename(name: &str) -> Option<Self> {
        if let Some(caps) = guest_pattern().captures(name) {
            return match &caps[1] {
                "qemu" => Some(GuestKind::Vm),
                _ => Some(GuestKind::Container),
            };
        }
        if name.contains(".vma") {
            Some(GuestKind::Vm)
        } else if name.contains(".tar") {
            Some(GuestKind::Container)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    Local,
    Offsite,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::Local => "local",
            ArtifactSource::Offsite => "offsite",
        }
    }
}

impl FromStr for ArtifactSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ArtifactSource::Local),
            "offsite" | "webdav" => Ok(ArtifactSource::Offsite),
            other => Err(format!("unknown restore source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum ArtifactLocation {
    /// Absolute path on the Proxmox host
    Remote(String),
    Local(PathBuf),
    /// File name inside the offsite collection
    Offsite(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub filename: String,
    pub location: ArtifactLocation,
    pub size: u64,
    /// Filesystem mtime or WebDAV getlastmodified
    pub modified: Option<DateTime<Utc>>,
    pub vmid: Option<String>,
    pub kind: Option<GuestKind>,
}

impl BackupArtifact {
    pub fn new(filename: impl Into<String>, location: ArtifactLocation) -> Self {
        let filename = filename.into();
        Self {
            vmid: extract_vmid(&filename),
            kind: GuestKind::from_filename(&filename),
            filename,
            location,
            size: 0,
            modified: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    /// Time used for retention ordering: the name's timestamp, else `modified`.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        filename_timestamp(&self.filename).or(self.modified)
    }
}

pub fn is_backup_archive(name: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

pub fn extract_vmid(name: &str) -> Option<String> {
    guest_pattern().captures(name).map(|c| c[2].to_string())
}

/// Accepts `YYYY_MM_DD-HH_MM_SS` as well as `YYYYMMDD_HHMMSS`. vzdump
/// stamps names in host-local time.
pub fn filename_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let caps = timestamp_pattern().captures(name)?;
    let num = |i: usize| caps[i].parse::<u32>().ok();
    let naive = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, num(2)?, num(3)?)?
        .and_hms_opt(num(4)?, num(5)?, num(6)?)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse a `source|filename` restore request.
pub fn parse_restore_request(request: &str) -> Result<(ArtifactSource, String), String> {
    let (source, filename) = request
        .split_once('|')
        .ok_or_else(|| format!("malformed restore request '{request}', expected source|filename"))?;
    let source = source.parse()?;
    let filename = filename.trim();
    if filename.is_empty() {
        return Err("restore request names no file".into());
    }
    Ok((source, filename.to_string()))
}

/// Archive file names are used verbatim in remote paths and shell commands.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Archives directly inside `dir`, unordered.
pub fn scan_local_dir(dir: &Path) -> std::io::Result<Vec<BackupArtifact>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_backup_archive(&name) {
            continue;
        }
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        artifacts.push(
            BackupArtifact::new(name, ArtifactLocation::Local(entry.path()))
                .with_size(meta.len())
                .with_modified(modified),
        );
    }
    Ok(artifacts)
}
