use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::progress::ProgressSnapshot;
use crate::resolver::StreamVariant;

pub type TaskId = Uuid;

/// Lifecycle of one download.
///
/// `Queued -> Resolving -> Downloading -> Merging -> Completed`, with
/// `Cancelled` reachable from every non-terminal state and `Failed` from the
/// three active ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Resolving,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Resolving => "resolving",
            TaskState::Downloading => "downloading",
            TaskState::Merging => "merging",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States that occupy an admission slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Resolving | TaskState::Downloading | TaskState::Merging
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Resolving)
                | (Resolving, Downloading)
                | (Downloading, Merging)
                | (Merging, Completed)
                | (Queued | Resolving | Downloading | Merging, Cancelled)
                | (Resolving | Downloading | Merging, Failed)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Queued => "Queued",
            TaskState::Resolving => "Resolving media",
            TaskState::Downloading => "Downloading",
            TaskState::Merging => "Merging video and audio",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Best,
    P1080,
    P720,
    P480,
    AudioOnly,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::P1080 => "1080p",
            Quality::P720 => "720p",
            Quality::P480 => "480p",
            Quality::AudioOnly => "audio",
        }
    }

    /// Upper bound on video height, `None` when any height is acceptable.
    pub fn max_height(&self) -> Option<u32> {
        match self {
            Quality::P1080 => Some(1080),
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
            Quality::Best | Quality::AudioOnly => None,
        }
    }

    pub fn wants_video(&self) -> bool {
        !matches!(self, Quality::AudioOnly)
    }
}

impl FromStr for Quality {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" | "" => Ok(Quality::Best),
            "1080p" | "1080" => Ok(Quality::P1080),
            "720p" | "720" => Ok(Quality::P720),
            "480p" | "480" => Ok(Quality::P480),
            "audio" | "audio-only" | "audio_only" => Ok(Quality::AudioOnly),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown quality tier: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    /// Tag handed to the credential provider, e.g. a browser name.
    pub credential_source: Option<String>,
    pub target_dir: PathBuf,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            quality: Quality::Best,
            credential_source: None,
            target_dir: target_dir.into(),
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_credential_source(mut self, source: impl Into<String>) -> Self {
        self.credential_source = Some(source.into());
        self
    }

    /// Checks shape only; reachability is discovered during resolution.
    pub fn validate(&self) -> CoreResult<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(CoreError::InvalidRequest("url is empty".to_string()));
        }
        url::Url::parse(url)
            .map_err(|err| CoreError::InvalidRequest(format!("malformed url {}: {}", url, err)))?;
        if !self.target_dir.is_dir() {
            return Err(CoreError::InvalidRequest(format!(
                "target directory does not exist: {}",
                self.target_dir.display()
            )));
        }
        if let Some(source) = &self.credential_source {
            if source.trim().is_empty() {
                return Err(CoreError::InvalidRequest(
                    "credential source tag is empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One stream set produced by resolution, owned by its task.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub index: usize,
    pub title: String,
    pub video: Option<StreamVariant>,
    pub audio: Option<StreamVariant>,
    pub video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
}

impl MediaItem {
    pub fn new(
        index: usize,
        title: String,
        video: Option<StreamVariant>,
        audio: Option<StreamVariant>,
    ) -> Self {
        Self {
            index,
            title,
            video,
            audio,
            video_path: None,
            audio_path: None,
        }
    }

    pub fn output_extension(&self) -> &'static str {
        if self.video.is_some() {
            "mp4"
        } else {
            "m4a"
        }
    }

    pub fn label(&self) -> String {
        format!("item {} ({})", self.index + 1, self.title)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TaskFailure {
    pub fn from_error(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Immutable copy of a task's published state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub url: String,
    pub quality: Quality,
    pub target_dir: PathBuf,
    pub state: TaskState,
    pub item_count: usize,
    pub progress: ProgressSnapshot,
    pub outputs: Vec<PathBuf>,
    pub failure: Option<TaskFailure>,
}

impl TaskView {
    pub fn queued(id: TaskId, request: &DownloadRequest) -> Self {
        Self {
            id,
            url: request.url.trim().to_string(),
            quality: request.quality,
            target_dir: request.target_dir.clone(),
            state: TaskState::Queued,
            item_count: 0,
            progress: ProgressSnapshot::for_state(TaskState::Queued),
            outputs: Vec::new(),
            failure: None,
        }
    }

    pub fn primary_output(&self) -> Option<&Path> {
        self.outputs.first().map(|path| path.as_path())
    }
}
