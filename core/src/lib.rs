pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod hls;
pub mod merge;
pub mod net;
pub mod progress;
pub mod publisher;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use crate::config::EngineConfig;
pub use crate::credentials::{CookieFileProvider, CredentialProvider, Credentials, StaticCredentials};
pub use crate::engine::{DownloadEngine, EngineBuilder};
pub use crate::error::{CoreError, CoreResult, ErrorKind};
pub use crate::events::{ChannelSink, EventSink, TaskEvent};
pub use crate::merge::{FfmpegMuxer, Muxer};
pub use crate::progress::ProgressSnapshot;
pub use crate::resolver::{MediaDescriptor, MediaResolver, StreamKind, StreamVariant};
pub use crate::task::{DownloadRequest, Quality, TaskId, TaskState, TaskView};

#[cfg(test)]
mod tests;
