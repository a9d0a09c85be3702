pub mod artifact;
pub mod history;
pub mod settings;

pub use artifact::{ArtifactLocation, ArtifactSource, BackupArtifact, GuestKind};
pub use history::{HistoryEntry, HistoryKind};
pub use settings::KvStore;
