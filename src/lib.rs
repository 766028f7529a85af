//! Resumable single-connection HTTP downloads with pause, resume and cancel,
//! grouped in an ordered registry that republishes per-download changes as
//! row events.

pub mod config;
pub mod downloader;
pub mod limiter;
pub mod models;
pub mod registry;
pub mod validation;

/// Convenient re-exports of the common types.
pub mod prelude {
    pub use crate::config::{ConfigError, DownloadConfig};
    pub use crate::downloader::{Download, DownloadError, DownloadOptions, UNKNOWN_SIZE};
    pub use crate::limiter::SpeedLimiter;
    pub use crate::models::{
        Actions, DownloadEvent, DownloadId, DownloadRow, DownloadStatus, EventKind, RegistryEvent,
    };
    pub use crate::registry::{DownloadRegistry, RegistryError};
    pub use crate::validation::{file_name, validate_url, UrlError};
}
