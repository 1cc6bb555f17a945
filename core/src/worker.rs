//! The pipeline one admitted task runs on its worker thread:
//! credentials, resolution, stream download, merge, promotion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::cleanup::{sanitize_filename, TempArtifactSet};
use crate::config::EngineConfig;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{CoreError, CoreResult};
use crate::fetch::{StreamFetcher, StreamJob};
use crate::merge::{MergeJob, Muxer, StreamMerger};
use crate::net::NetClient;
use crate::progress::{ProgressAggregator, SharedProgress, StreamSlot};
use crate::publisher::TaskPublisher;
use crate::resolver::{select_streams, MediaDescriptor, MediaResolver};
use crate::task::{DownloadRequest, MediaItem, TaskId, TaskState};

const MAX_TITLE_CHARS: usize = 100;

/// Everything a worker needs, handed over at admission.
#[derive(Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub request: DownloadRequest,
    pub config: Arc<EngineConfig>,
    pub resolver: Arc<dyn MediaResolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub net: Arc<dyn NetClient>,
    pub muxer: Arc<dyn Muxer>,
    pub cancel: CancelToken,
    pub artifacts: Arc<TempArtifactSet>,
    pub publisher: Arc<TaskPublisher>,
}

/// Runs the task to a terminal state.
///
/// Temp files are released before the terminal event goes out, so an
/// observer that sees `Completed`, `Failed` or `Cancelled` never finds
/// leftovers on disk.
pub fn run(ctx: &TaskContext) -> TaskState {
    let outcome = ctx
        .publisher
        .transition(TaskState::Resolving)
        .and_then(|()| pipeline(ctx));
    ctx.artifacts.release();
    match outcome {
        Ok(outputs) => {
            info!(task = %ctx.id, files = outputs.len(), "download complete");
            ctx.publisher.complete(outputs);
        }
        // A cancel that lands mid-step can surface as any error; report it as a cancel.
        Err(_) if ctx.cancel.is_cancelled() => {
            ctx.publisher.cancelled();
        }
        Err(err) => {
            ctx.publisher.fail(&err);
        }
    }
    ctx.publisher.state()
}

fn pipeline(ctx: &TaskContext) -> CoreResult<Vec<PathBuf>> {
    ctx.cancel.check()?;
    let credentials = load_credentials(ctx)?;

    ctx.cancel.check()?;
    debug!(task = %ctx.id, url = %ctx.request.url, "resolving");
    let descriptors = ctx
        .resolver
        .resolve(ctx.request.url.trim(), credentials.as_ref())?;
    ctx.cancel.check()?;
    let mut items = build_items(&descriptors, ctx)?;
    ctx.publisher.set_item_count(items.len());

    ctx.publisher.transition(TaskState::Downloading)?;
    download_items(ctx, credentials, &mut items)?;

    ctx.cancel.check()?;
    ctx.publisher.transition(TaskState::Merging)?;
    let merger = StreamMerger::new(Arc::clone(&ctx.muxer), ctx.config.remux_single_streams);
    let jobs = items
        .iter()
        .map(|item| -> CoreResult<MergeJob> {
            Ok(MergeJob {
                label: item.label(),
                video: item.video_path.clone(),
                audio: item.audio_path.clone(),
                output: ctx.artifacts.allocate(&format!(
                    "item{}.merged.{}",
                    item.index,
                    item.output_extension()
                ))?,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;
    let finished = merger.merge_all(&jobs, &ctx.cancel)?;

    ctx.cancel.check()?;
    promote_all(ctx, &items, &finished)
}

fn load_credentials(ctx: &TaskContext) -> CoreResult<Option<Credentials>> {
    let Some(tag) = ctx.request.credential_source.as_deref() else {
        return Ok(None);
    };
    match ctx.credentials.get_credentials(tag) {
        Ok(credentials) => Ok(credentials),
        Err(err @ CoreError::CredentialsUnavailable { .. }) => Err(err),
        Err(err) => Err(CoreError::CredentialsUnavailable {
            source_tag: tag.to_string(),
            detail: err.to_string(),
        }),
    }
}

fn build_items(descriptors: &[MediaDescriptor], ctx: &TaskContext) -> CoreResult<Vec<MediaItem>> {
    if descriptors.is_empty() {
        return Err(CoreError::NotFound(format!(
            "no media found at {}",
            ctx.request.url.trim()
        )));
    }
    let count = descriptors.len();
    descriptors
        .iter()
        .enumerate()
        .map(|(index, descriptor)| -> CoreResult<MediaItem> {
            let (video, audio) = select_streams(descriptor, ctx.request.quality)?;
            Ok(MediaItem::new(
                index,
                item_title(&descriptor.title, index, count),
                video,
                audio,
            ))
        })
        .collect()
}

/// File stem for an item. The ` (i of n)` suffix of multi-item posts always
/// survives; the title is cut to make room for it.
fn item_title(title: &str, index: usize, count: usize) -> String {
    let suffix = if count > 1 {
        format!(" ({} of {})", index + 1, count)
    } else {
        String::new()
    };
    let room = MAX_TITLE_CHARS.saturating_sub(suffix.chars().count());
    let base: String = sanitize_filename(title).chars().take(room).collect();
    let base = base.trim_end_matches(&[' ', '.', '_'][..]);
    let base = if base.is_empty() { "video" } else { base };
    format!("{}{}", base, suffix)
}

/// Items are fetched one after another; the streams of an item in parallel.
fn download_items(
    ctx: &TaskContext,
    credentials: Option<Credentials>,
    items: &mut [MediaItem],
) -> CoreResult<()> {
    let publisher = Arc::clone(&ctx.publisher);
    let progress = Arc::new(SharedProgress::new(
        ProgressAggregator::new(ctx.config.progress_interval(), ctx.config.rate_window()),
        move |snapshot| publisher.progress(snapshot),
    ));
    let mut slots: HashMap<(usize, &'static str), StreamSlot> = HashMap::new();
    for item in items.iter() {
        if let Some(video) = &item.video {
            slots.insert((item.index, "video"), progress.add_stream(video.declared_size));
        }
        if let Some(audio) = &item.audio {
            slots.insert((item.index, "audio"), progress.add_stream(audio.declared_size));
        }
    }
    progress.publish_now();

    let fetcher = StreamFetcher {
        task_id: ctx.id,
        net: Arc::clone(&ctx.net),
        config: Arc::clone(&ctx.config),
        credentials,
        artifacts: Arc::clone(&ctx.artifacts),
        progress: Arc::clone(&progress),
    };
    let count = items.len();
    for item in items.iter_mut() {
        ctx.cancel.check()?;
        progress.set_item(item.index, count);
        let mut jobs = Vec::with_capacity(2);
        for (label, variant) in [("video", &item.video), ("audio", &item.audio)] {
            let Some(variant) = variant else {
                continue;
            };
            jobs.push(StreamJob {
                label,
                variant: variant.clone(),
                path: ctx
                    .artifacts
                    .allocate(&format!("item{}.{}.part", item.index, label))?,
                slot: slots.get(&(item.index, label)).copied().unwrap_or_default(),
            });
        }
        debug!(task = %ctx.id, item = item.index, streams = jobs.len(), "downloading item");
        fetch_item(&fetcher, &jobs, &ctx.cancel)?;
        for job in jobs {
            match job.label {
                "video" => item.video_path = Some(job.path),
                _ => item.audio_path = Some(job.path),
            }
        }
    }
    Ok(())
}

/// Fetches the streams of one item concurrently. The first real failure
/// stops the sibling and becomes the item's error.
fn fetch_item(fetcher: &StreamFetcher, jobs: &[StreamJob], cancel: &CancelToken) -> CoreResult<()> {
    let item_cancel = cancel.child();
    let results: Vec<CoreResult<u64>> = thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|job| {
                let item_cancel = &item_cancel;
                scope.spawn(move || {
                    let result = fetcher.fetch(job, item_cancel);
                    if result.is_err() {
                        item_cancel.cancel();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(CoreError::InvalidState("stream worker panicked".to_string())))
            })
            .collect()
    });

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    let mut first_cancel = None;
    for result in results {
        match result {
            Ok(_) => {}
            Err(err) if err.is_cancelled() => first_cancel = Some(err),
            Err(err) => return Err(err),
        }
    }
    match first_cancel {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Moves every finished file into the target directory. Either all of them
/// land, or the ones already moved are removed again.
fn promote_all(ctx: &TaskContext, items: &[MediaItem], finished: &[PathBuf]) -> CoreResult<Vec<PathBuf>> {
    let mut promoted: Vec<PathBuf> = Vec::with_capacity(finished.len());
    for (item, path) in items.iter().zip(finished) {
        match ctx
            .artifacts
            .promote(path, &ctx.request.target_dir, &item.title, item.output_extension())
        {
            Ok(dest) => promoted.push(dest),
            Err(err) => {
                warn!(task = %ctx.id, error = %err, "promotion failed; rolling back");
                for dest in &promoted {
                    if let Err(remove_err) = std::fs::remove_file(dest) {
                        warn!(
                            task = %ctx.id,
                            path = %dest.display(),
                            error = %remove_err,
                            "failed to remove promoted file during rollback"
                        );
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(promoted)
}
