//! Stream merging: video + audio into one container via an external muxer.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LINES: usize = 8;

pub trait Muxer: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `ToolchainUnavailable` when the muxer cannot run at all.
    fn check_available(&self) -> CoreResult<()>;

    /// Writes `output` holding the video track of `video` and the audio track of `audio`.
    fn mux(&self, video: &Path, audio: &Path, output: &Path, cancel: &CancelToken)
        -> CoreResult<()>;

    /// Rewrites a single stream into a clean container; `audio_only` drops any video.
    fn rewrap(&self, input: &Path, output: &Path, audio_only: bool, cancel: &CancelToken)
        -> CoreResult<()>;
}

/// Runs the `ffmpeg` binary with stream copy, never re-encoding.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        configure_for_background(&mut cmd);
        cmd
    }

    fn tool_missing(&self, err: &io::Error) -> CoreError {
        CoreError::ToolchainUnavailable {
            tool: self.program.display().to_string(),
            detail: err.to_string(),
        }
    }

    fn run(&self, args: Vec<OsString>, output: &Path, cancel: &CancelToken) -> CoreResult<()> {
        cancel.check()?;
        let mut child = self
            .command()
            .args(["-nostdin", "-y", "-loglevel", "error"])
            .args(&args)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => self.tool_missing(&err),
                _ => CoreError::Io(err),
            })?;

        // Drain stderr on the side so a chatty muxer never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let status = wait_or_kill(&mut child, cancel);
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let status = status?;
        if status.success() {
            return Ok(());
        }
        Err(CoreError::MergeFailed {
            item: output.display().to_string(),
            detail: format!(
                "{} exited with {}: {}",
                self.name(),
                status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "a signal".to_string()),
                stderr_tail(&stderr)
            ),
        })
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Muxer for FfmpegMuxer {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn check_available(&self) -> CoreResult<()> {
        let output = self
            .command()
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| self.tool_missing(&err))?;
        if !output.status.success() {
            return Err(CoreError::ToolchainUnavailable {
                tool: self.program.display().to_string(),
                detail: format!("-version exited with {}", output.status),
            });
        }
        let version = String::from_utf8_lossy(&output.stdout);
        debug!(version = %version.lines().next().unwrap_or("").trim(), "ffmpeg available");
        Ok(())
    }

    fn mux(&self, video: &Path, audio: &Path, output: &Path, cancel: &CancelToken) -> CoreResult<()> {
        let args: Vec<OsString> = vec![
            "-i".into(),
            video.into(),
            "-i".into(),
            audio.into(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c".into(),
            "copy".into(),
            "-movflags".into(),
            "+faststart".into(),
        ];
        self.run(args, output, cancel)
    }

    fn rewrap(&self, input: &Path, output: &Path, audio_only: bool, cancel: &CancelToken) -> CoreResult<()> {
        let mut args: Vec<OsString> = vec!["-i".into(), input.into()];
        if audio_only {
            args.push("-vn".into());
        }
        args.push("-c".into());
        args.push("copy".into());
        self.run(args, output, cancel)
    }
}

fn wait_or_kill(child: &mut Child, cancel: &CancelToken) -> CoreResult<std::process::ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CoreError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        return "no diagnostic output".to_string();
    }
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ")
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// The streams of one item and where its merged file goes.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub label: String,
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
    /// Allocated temp path for the muxer's output.
    pub output: PathBuf,
}

pub struct StreamMerger {
    muxer: Arc<dyn Muxer>,
    remux_single_streams: bool,
}

impl StreamMerger {
    pub fn new(muxer: Arc<dyn Muxer>, remux_single_streams: bool) -> Self {
        Self {
            muxer,
            remux_single_streams,
        }
    }

    /// Whether any job will invoke the muxer.
    pub fn requires_toolchain(&self, jobs: &[MergeJob]) -> bool {
        jobs.iter().any(|job| {
            (job.video.is_some() && job.audio.is_some())
                || (self.remux_single_streams && (job.video.is_some() || job.audio.is_some()))
        })
    }

    /// Produces one finished file per job, in order.
    ///
    /// The toolchain is checked once before the first job so that a missing
    /// muxer is reported before any work is done. Single-stream jobs are
    /// passed through untouched unless rewrapping is enabled.
    pub fn merge_all(&self, jobs: &[MergeJob], cancel: &CancelToken) -> CoreResult<Vec<PathBuf>> {
        if self.requires_toolchain(jobs) {
            self.muxer.check_available()?;
        }
        let mut finished = Vec::with_capacity(jobs.len());
        for job in jobs {
            cancel.check()?;
            finished.push(self.merge_one(job, cancel)?);
        }
        Ok(finished)
    }

    fn merge_one(&self, job: &MergeJob, cancel: &CancelToken) -> CoreResult<PathBuf> {
        let result = match (&job.video, &job.audio) {
            (Some(video), Some(audio)) => {
                info!(item = %job.label, muxer = self.muxer.name(), "merging video and audio");
                self.muxer.mux(video, audio, &job.output, cancel)
            }
            (Some(single), None) | (None, Some(single)) => {
                if !self.remux_single_streams {
                    return Ok(single.clone());
                }
                self.muxer
                    .rewrap(single, &job.output, job.video.is_none(), cancel)
            }
            (None, None) => {
                return Err(CoreError::MergeFailed {
                    item: job.label.clone(),
                    detail: "no streams were downloaded".to_string(),
                })
            }
        };
        match result {
            Ok(()) if job.output.is_file() => Ok(job.output.clone()),
            Ok(()) => Err(CoreError::MergeFailed {
                item: job.label.clone(),
                detail: format!("{} produced no output", self.muxer.name()),
            }),
            Err(err @ (CoreError::Cancelled | CoreError::ToolchainUnavailable { .. })) => Err(err),
            Err(CoreError::MergeFailed { detail, .. }) => Err(CoreError::MergeFailed {
                item: job.label.clone(),
                detail,
            }),
            Err(other) => Err(CoreError::MergeFailed {
                item: job.label.clone(),
                detail: other.to_string(),
            }),
        }
    }
}
