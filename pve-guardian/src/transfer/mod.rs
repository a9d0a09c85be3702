//! Transfer helpers shared by the SSH and WebDAV paths.

pub mod progress;

pub use progress::{format_bytes, throttled, ProgressCallback, ProgressThrottle};
