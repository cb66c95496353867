use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::record::{SortColumn, StreamRecord};

/// Per-stream label shown next to a record. Absence means "never checked".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Working,
    #[serde(rename = "Not Responding")]
    NotResponding,
    Playing,
    Stopped,
}

impl StreamStatus {
    pub fn from_probe(alive: bool) -> Self {
        if alive {
            StreamStatus::Working
        } else {
            StreamStatus::NotResponding
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamStatus::Working => "Working",
            StreamStatus::NotResponding => "Not Responding",
            StreamStatus::Playing => "Playing",
            StreamStatus::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Buckets for user-facing notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeCategory {
    NoSelection,
    EmptyUrl,
    EngineUnavailable,
    PlaybackError,
    FileError,
    FileExists,
    InvalidInput,
    NoData,
    CheckResult,
    Saved,
    Info,
}

/// Requests into the core. Each one is answered exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Load { path: Option<PathBuf> },
    Save {
        path: Option<PathBuf>,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        backup: bool,
    },
    Add { record: StreamRecord },
    Update { index: usize, record: StreamRecord },
    Delete { index: usize },
    Play { index: Option<usize> },
    Stop,
    Check { index: Option<usize> },
    CheckAll,
    CancelCheck,
}

/// Successful answer to a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reply {
    /// The command took effect synchronously.
    Done,
    /// Background work was started; results arrive as events.
    Started,
    /// The command was valid but had nothing to do (e.g. a batch check is
    /// already running).
    Ignored { reason: String },
    Added { index: usize },
    Loaded { count: usize, path: PathBuf },
    Saved {
        path: PathBuf,
        backup: Option<PathBuf>,
    },
}

/// Everything the status sink receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    StatusChanged {
        index: usize,
        status: Option<StreamStatus>,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    CheckFinished {
        completed: usize,
        total: usize,
        cancelled: bool,
    },
    PlaybackChanged {
        current: Option<usize>,
    },
    RecordsChanged {
        count: usize,
    },
    Notice {
        category: NoticeCategory,
        message: String,
    },
    Log {
        message: String,
    },
}

impl Event {
    pub fn notice(category: NoticeCategory, message: impl Into<String>) -> Self {
        Event::Notice {
            category,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackPhase {
    #[default]
    Stopped,
    Starting,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckProgress {
    pub completed: usize,
    pub total: usize,
}

/// Immutable view of the core's state. `rev` increases on every publish so
/// clients can tell whether they missed an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreState {
    #[serde(default)]
    pub rev: u64,
    pub file_path: Option<PathBuf>,
    pub records: Vec<StreamRecord>,
    pub statuses: BTreeMap<usize, StreamStatus>,
    pub current: Option<usize>,
    pub playback: PlaybackPhase,
    pub check: Option<CheckProgress>,
}

/// Filter + sort for the list view. Empty filters match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub sort: Option<SortColumn>,
    #[serde(default)]
    pub desc: bool,
}
