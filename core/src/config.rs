use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub rate_window_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Parent for per-task temp dirs. `None` keeps them inside the target directory.
    pub temp_root: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub remux_single_streams: bool,
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            retry_count: 3,
            retry_backoff_ms: 500,
            chunk_size: 64 * 1024,
            progress_interval_ms: 100,
            rate_window_ms: 1000,
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            user_agent: "mediagrab/0.1".to_string(),
            temp_root: None,
            ffmpeg_path: "ffmpeg".to_string(),
            remux_single_streams: true,
            shutdown_grace_ms: 3000,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MEDIAGRAB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse::<usize>("MEDIAGRAB_MAX_CONCURRENT") {
            config.max_concurrent_tasks = value;
        }
        if let Some(value) = env_parse::<u32>("MEDIAGRAB_RETRIES") {
            config.retry_count = value;
        }
        if let Some(value) = env_parse::<u64>("MEDIAGRAB_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = value;
        }
        if let Ok(dir) = env::var("MEDIAGRAB_TEMP_DIR") {
            if !dir.trim().is_empty() {
                config.temp_root = Some(PathBuf::from(dir));
            }
        }
        if let Ok(path) = env::var("MEDIAGRAB_FFMPEG") {
            if !path.trim().is_empty() {
                config.ffmpeg_path = path;
            }
        }
        config
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(CoreError::InvalidRequest(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(CoreError::InvalidRequest(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(5)))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
