use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("media not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("credentials unavailable for source {source_tag}: {detail}")]
    CredentialsUnavailable { source_tag: String, detail: String },
    #[error("{stream} stream failed: {detail}")]
    StreamFetch { stream: String, detail: String },
    #[error("{tool} is not available: {detail}")]
    ToolchainUnavailable { tool: String, detail: String },
    #[error("merge failed for {item}: {detail}")]
    MergeFailed { item: String, detail: String },
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
    #[error("cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CoreError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            CoreError::AuthRequired(_) => ErrorKind::AuthRequired,
            CoreError::Network(_) => ErrorKind::NetworkError,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Unsupported(_) => ErrorKind::Unsupported,
            CoreError::CredentialsUnavailable { .. } => ErrorKind::CredentialsUnavailable,
            CoreError::StreamFetch { .. } => ErrorKind::StreamFetchError,
            CoreError::ToolchainUnavailable { .. } => ErrorKind::ToolchainUnavailable,
            CoreError::MergeFailed { .. } => ErrorKind::MergeFailed,
            CoreError::Io(_) => ErrorKind::Io,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::InvalidState(_) | CoreError::Poisoned(_) => ErrorKind::Internal,
        }
    }

    /// Whether a single stream fetch may be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Maps an HTTP status to the error class used by resolution and fetching.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            401 | 403 => CoreError::AuthRequired(format!("status {} for {}", status, url)),
            404 | 410 => CoreError::NotFound(format!("status {} for {}", status, url)),
            408 | 429 | 500..=599 => CoreError::Network(format!("status {} for {}", status, url)),
            _ => CoreError::Unsupported(format!("status {} for {}", status, url)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    TaskNotFound,
    AuthRequired,
    NetworkError,
    NotFound,
    Unsupported,
    CredentialsUnavailable,
    StreamFetchError,
    ToolchainUnavailable,
    MergeFailed,
    Io,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::CredentialsUnavailable => "credentials_unavailable",
            ErrorKind::StreamFetchError => "stream_fetch_error",
            ErrorKind::ToolchainUnavailable => "toolchain_unavailable",
            ErrorKind::MergeFailed => "merge_failed",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Short explanation suitable for showing next to a failed download.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "The download request is incomplete or malformed.",
            ErrorKind::TaskNotFound => "No such download.",
            ErrorKind::AuthRequired => {
                "This post requires authentication. Select a credential source and try again."
            }
            ErrorKind::NetworkError => "Network error. Please check your internet connection.",
            ErrorKind::NotFound => "Post not found. It may have been deleted or the URL is wrong.",
            ErrorKind::Unsupported => "This URL or media format is not supported.",
            ErrorKind::CredentialsUnavailable => {
                "Cannot access the selected credential source. Try another one."
            }
            ErrorKind::StreamFetchError => "A media stream could not be downloaded completely.",
            ErrorKind::ToolchainUnavailable => {
                "The media toolchain (ffmpeg) is missing. Install it and try again."
            }
            ErrorKind::MergeFailed => "The downloaded streams could not be combined.",
            ErrorKind::Io => "A file could not be written to the download folder.",
            ErrorKind::Cancelled => "Download cancelled.",
            ErrorKind::Internal => "Unexpected internal error.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
