use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mediagrab_core::cleanup::sweep_stale;
use mediagrab_core::progress::format_bytes;
use mediagrab_core::{
    ChannelSink, CookieFileProvider, DownloadEngine, DownloadRequest, EngineConfig, Quality,
    TaskEvent, TaskId,
};

const COOKIE_SOURCE: &str = "cookies-file";
const PROGRESS_EVERY: Duration = Duration::from_secs(1);
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "mediagrab")]
#[command(about = "Download media posts, merging separate video and audio streams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more posts
    Get(GetArgs),
    /// Remove temp directories left behind by an interrupted run
    Sweep {
        /// Directory to clean
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Args)]
struct GetArgs {
    /// Post URLs; queued in the order given
    #[arg(required = true)]
    urls: Vec<String>,
    /// Target directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// best, 1080p, 720p, 480p or audio
    #[arg(short, long, default_value = "best", value_parser = parse_quality)]
    quality: Quality,
    /// Maximum downloads running at once
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Retries per stream after a network error
    #[arg(long)]
    retries: Option<u32>,
    /// Netscape cookies.txt for posts that need a login
    #[arg(long)]
    cookies: Option<PathBuf>,
    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<String>,
    /// Keep single streams exactly as served
    #[arg(long)]
    no_remux: bool,
    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Get(args) => run_get(args),
        Commands::Sweep { dir } => {
            let removed = sweep_stale(&dir)
                .with_context(|| format!("failed to sweep {}", dir.display()))?;
            println!("removed {} stale temp dir(s)", removed);
            Ok(())
        }
    }
}

fn parse_quality(value: &str) -> Result<Quality, String> {
    value.parse::<Quality>().map_err(|err| err.to_string())
}

fn build_config(args: &GetArgs) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(jobs) = args.jobs {
        config.max_concurrent_tasks = jobs;
    }
    if let Some(retries) = args.retries {
        config.retry_count = retries;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg_path = ffmpeg.clone();
    }
    if args.no_remux {
        config.remux_single_streams = false;
    }
    config
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// Cancel every download and let the workers clean up.
    Shutdown,
    /// Second Ctrl-C: leave immediately; the next run sweeps the leftovers.
    Exit,
}

fn next_interrupt(interrupted: &AtomicBool) -> Interrupt {
    if interrupted.swap(true, Ordering::SeqCst) {
        Interrupt::Exit
    } else {
        Interrupt::Shutdown
    }
}

fn install_interrupt_handler(engine: Arc<DownloadEngine>, interrupted: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || match next_interrupt(&interrupted) {
        Interrupt::Shutdown => {
            eprintln!("interrupted; cancelling downloads (press Ctrl-C again to quit now)");
            engine.shutdown();
        }
        Interrupt::Exit => std::process::exit(INTERRUPTED_EXIT_CODE),
    })
    .context("failed to install the Ctrl-C handler")
}

fn run_get(args: GetArgs) -> Result<()> {
    let (sender, receiver) = mpsc::channel();
    let mut builder = DownloadEngine::builder(build_config(&args))
        .with_event_sink(Arc::new(ChannelSink::new(sender)));
    if let Some(path) = &args.cookies {
        builder = builder
            .with_credentials(Arc::new(CookieFileProvider::new().with_file(COOKIE_SOURCE, path)));
    }
    let engine = Arc::new(builder.build().context("failed to start the download engine")?);
    let interrupted = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&engine), Arc::clone(&interrupted))?;

    if let Err(err) = engine.sweep_stale_temp(&args.output) {
        warn!(dir = %args.output.display(), error = %err, "could not sweep stale temp dirs");
    }

    let mut reporter = Reporter::new(args.json);
    let mut pending: HashSet<TaskId> = HashSet::new();
    let mut failures = 0usize;
    for url in &args.urls {
        let mut request = DownloadRequest::new(url.as_str(), &args.output).with_quality(args.quality);
        if args.cookies.is_some() {
            request = request.with_credential_source(COOKIE_SOURCE);
        }
        match engine.submit(request) {
            Ok(id) => {
                pending.insert(id);
                reporter.names.insert(id, url.clone());
            }
            Err(err) => {
                eprintln!("{}: {}", url, err);
                failures += 1;
            }
        }
    }

    while !pending.is_empty() {
        let event = match receiver.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if event.is_terminal() {
            pending.remove(&event.task_id());
            if matches!(event, TaskEvent::TaskFailed { .. }) {
                failures += 1;
            }
        }
        reporter.show(&event)?;
    }
    engine.wait_all().context("failed waiting for workers")?;
    engine.shutdown();

    if interrupted.load(Ordering::SeqCst) {
        bail!("interrupted; partial downloads were removed");
    }
    if failures > 0 {
        bail!("{} of {} download(s) failed", failures, args.urls.len());
    }
    Ok(())
}

struct Reporter {
    json: bool,
    names: HashMap<TaskId, String>,
    last_line: HashMap<TaskId, (String, Instant)>,
}

impl Reporter {
    fn new(json: bool) -> Self {
        Self {
            json,
            names: HashMap::new(),
            last_line: HashMap::new(),
        }
    }

    fn show(&mut self, event: &TaskEvent) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }
        let id = event.task_id();
        let short = id.simple().to_string()[..8].to_string();
        match event {
            TaskEvent::TaskCreated { url, .. } => println!("[{}] queued {}", short, url),
            TaskEvent::TaskProgress { snapshot, .. } => {
                let state = snapshot.state.to_string();
                let now = Instant::now();
                // New states always print; repeated progress at most once a second.
                let due = match self.last_line.get(&id) {
                    Some((last_state, at)) => {
                        *last_state != state || now.duration_since(*at) >= PROGRESS_EVERY
                    }
                    None => true,
                };
                if due {
                    let percent = snapshot
                        .percent()
                        .map(|value| format!("{:5.1}% ", value))
                        .unwrap_or_default();
                    println!("[{}] {}{}", short, percent, snapshot.stage);
                    self.last_line.insert(id, (state, now));
                }
            }
            TaskEvent::TaskCompleted { outputs, .. } => {
                for output in outputs {
                    let size = fs::metadata(output).map(|meta| meta.len()).unwrap_or(0);
                    println!("[{}] saved {} ({})", short, output.display(), format_bytes(size));
                }
            }
            TaskEvent::TaskFailed { kind, detail, .. } => {
                let name = self.names.get(&id).map(String::as_str).unwrap_or("download");
                eprintln!("[{}] {} failed: {}", short, name, kind.hint());
                eprintln!("[{}]   {}", short, detail);
            }
            TaskEvent::TaskCancelled { .. } => println!("[{}] cancelled", short),
        }
        Ok(())
    }
}
