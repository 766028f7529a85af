// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a download inside a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The status of a download.
///
/// `Downloading` and `Paused` are the only non-terminal states. `Error` is
/// terminal for the fetch attempt but can be left through `resume()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DownloadStatus {
    Downloading = 0,
    Paused = 1,
    Complete = 2,
    Cancelled = 3,
    Error = 4,
}

impl DownloadStatus {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Downloading,
            1 => Self::Paused,
            2 => Self::Complete,
            3 => Self::Cancelled,
            _ => Self::Error,
        }
    }

    /// Human readable label, as shown in the status column.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Cancelled => "Cancelled",
            Self::Error => "Error",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }

    /// True while a fetch may still touch the destination file.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }

    /// Commands a collaborator may issue in this status.
    pub const fn actions(self) -> Actions {
        match self {
            Self::Downloading => Actions { pause: true, resume: false, cancel: true, clear: false },
            Self::Paused => Actions { pause: false, resume: true, cancel: true, clear: false },
            Self::Error => Actions { pause: false, resume: true, cancel: false, clear: true },
            Self::Complete | Self::Cancelled => Actions { pause: false, resume: false, cancel: false, clear: true },
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Which commands are currently meaningful for a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Actions {
    pub pause: bool,
    pub resume: bool,
    pub cancel: bool,
    pub clear: bool,
}

/// What changed on a download. Values are captured at emission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The server reported the resource length.
    SizeKnown(u64),
    /// A chunk was written; `transferred` is the running byte count.
    ProgressAdvanced { transferred: u64 },
    StatusChanged(DownloadStatus),
}

/// A change notification emitted by a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub id: DownloadId,
    pub kind: EventKind,
}

/// Row-level notification republished by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    RowInserted { index: usize },
    RowUpdated { index: usize, id: DownloadId, kind: EventKind },
    RowRemoved { index: usize },
}

/// Point-in-time view of a download, one field per table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRow {
    pub id: DownloadId,
    pub url: String,
    /// `None` until the first successful response.
    pub size: Option<u64>,
    /// Percentage in `0.0..=100.0`, `None` while the size is unknown.
    pub progress: Option<f32>,
    pub status: DownloadStatus,
}

impl DownloadRow {
    /// Size column text; empty while unknown.
    pub fn size_label(&self) -> String {
        self.size.map(|s| s.to_string()).unwrap_or_default()
    }
}
