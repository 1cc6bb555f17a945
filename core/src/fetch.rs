//! Fetching of a single stream into a tracked temp file.

use std::io::{self, ErrorKind as IoErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::cleanup::TempArtifactSet;
use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::error::{CoreError, CoreResult};
use crate::hls::{is_hls_locator, open_hls};
use crate::net::{FetchRequest, NetClient};
use crate::progress::{SharedProgress, StreamSlot};
use crate::resolver::StreamVariant;
use crate::task::TaskId;

/// One stream of one item, bound to its temp path and progress slot.
#[derive(Debug, Clone)]
pub struct StreamJob {
    /// "video" or "audio"; used in errors and logs.
    pub label: &'static str,
    pub variant: StreamVariant,
    pub path: PathBuf,
    pub slot: StreamSlot,
}

pub struct StreamFetcher {
    pub task_id: TaskId,
    pub net: Arc<dyn NetClient>,
    pub config: Arc<EngineConfig>,
    pub credentials: Option<Credentials>,
    pub artifacts: Arc<TempArtifactSet>,
    pub progress: Arc<SharedProgress>,
}

impl StreamFetcher {
    /// Downloads `job` completely, retrying transient failures with backoff.
    ///
    /// Returns the number of bytes in the finished file. Cancellation is
    /// observed between chunks and during backoff, and surfaces as
    /// `CoreError::Cancelled`; every other failure becomes `StreamFetch`.
    pub fn fetch(&self, job: &StreamJob, cancel: &CancelToken) -> CoreResult<u64> {
        let mut written = 0u64;
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            match self.transfer(job, cancel, &mut written) {
                Ok(()) => {
                    self.progress.finish(job.slot);
                    debug!(task = %self.task_id, stream = job.label, bytes = written, "stream complete");
                    return Ok(written);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if err.is_transient() && attempt < self.config.retry_count => {
                    let backoff = self.config.retry_backoff(attempt);
                    warn!(
                        task = %self.task_id,
                        stream = job.label,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying stream"
                    );
                    attempt += 1;
                    cancel.sleep(backoff)?;
                }
                Err(err) => {
                    return Err(CoreError::StreamFetch {
                        stream: job.label.to_string(),
                        detail: err.to_string(),
                    })
                }
            }
        }
    }

    fn transfer(&self, job: &StreamJob, cancel: &CancelToken, written: &mut u64) -> CoreResult<()> {
        let hls = is_hls_locator(&job.variant.locator);
        let mut req = FetchRequest::new(job.variant.locator.clone())
            .with_credentials(self.credentials.as_ref());
        if !hls {
            req = req.with_range_start(*written);
        }
        let body = if hls {
            open_hls(Arc::clone(&self.net), &req)?
        } else {
            self.net.open(&req)?
        };

        let append = body.resumed && *written > 0;
        if !append && *written > 0 {
            debug!(task = %self.task_id, stream = job.label, "server ignored range; starting over");
            self.progress.restart(job.slot);
            *written = 0;
        }
        let expected = body.total_bytes.or(job.variant.declared_size);
        self.progress.set_total(job.slot, body.total_bytes);

        let mut reader = body.reader;
        let mut writer = self.artifacts.create_writer(&job.path, append)?;
        let mut buffer = vec![0u8; self.config.chunk_size];
        loop {
            cancel.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(read) => read,
                Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => return Err(read_error(err)),
            };
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            *written += read as u64;
            self.progress.record(job.slot, read as u64);
        }
        writer.flush()?;

        if let Some(expected) = body.total_bytes {
            if *written < expected {
                return Err(CoreError::Network(format!(
                    "connection closed after {} of {} bytes",
                    written, expected
                )));
            }
        }
        if *written == 0 && expected != Some(0) {
            return Err(CoreError::Network("empty response body".to_string()));
        }
        Ok(())
    }
}

/// Unwraps a `CoreError` carried inside an io error; anything else is a network failure.
fn read_error(err: io::Error) -> CoreError {
    let message = err.to_string();
    match err.into_inner().map(|inner| inner.downcast::<CoreError>()) {
        Some(Ok(inner)) => *inner,
        _ => CoreError::Network(message),
    }
}
