use std::path::PathBuf;

use crate::protocol::NoticeCategory;
use crate::record::ValidationError;

/// Every failure a stream operation can report back to a front end.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A record failed validation. `index` is set when the record sits in
    /// the collection (the pre-save gate), unset for a candidate record.
    #[error("{}", describe_validation(.index, .source))]
    Validation {
        index: Option<usize>,
        source: ValidationError,
    },
    #[error("no stream at index {index} (have {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Please select a stream first.")]
    NoSelection,
    #[error("The selected stream does not have a URL to play.")]
    EmptyUrl,
    #[error("mpv is required for playback: {0}")]
    EngineUnavailable(String),
    #[error("Could not start playback: {0}")]
    Playback(String),
    #[error("{}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} already exists", .0.display())]
    FileExists(PathBuf),
    #[error("{0}")]
    NoData(&'static str),
    #[error("daemon is shutting down")]
    ShuttingDown,
}

fn describe_validation(index: &Option<usize>, source: &ValidationError) -> String {
    match index {
        Some(i) => format!("Error in stream {}: {}", i + 1, source),
        None => source.to_string(),
    }
}

impl StreamError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// The notification category a front end should file this error under.
    pub fn category(&self) -> NoticeCategory {
        match self {
            StreamError::Validation { .. } => NoticeCategory::InvalidInput,
            StreamError::IndexOutOfRange { .. } | StreamError::NoSelection => {
                NoticeCategory::NoSelection
            }
            StreamError::EmptyUrl => NoticeCategory::EmptyUrl,
            StreamError::EngineUnavailable(_) => NoticeCategory::EngineUnavailable,
            StreamError::Playback(_) => NoticeCategory::PlaybackError,
            StreamError::Persistence { .. } => NoticeCategory::FileError,
            StreamError::FileExists(_) => NoticeCategory::FileExists,
            StreamError::NoData(_) => NoticeCategory::NoData,
            StreamError::ShuttingDown => NoticeCategory::Info,
        }
    }
}

impl From<ValidationError> for StreamError {
    fn from(source: ValidationError) -> Self {
        StreamError::Validation {
            index: None,
            source,
        }
    }
}
