use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::cleanup::{sweep_stale, TempArtifactSet};
use crate::config::EngineConfig;
use crate::credentials::{CredentialProvider, NoCredentials};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, NullSink};
use crate::merge::{FfmpegMuxer, Muxer};
use crate::net::{NetClient, ReqwestNetClient};
use crate::progress::ProgressSnapshot;
use crate::publisher::TaskPublisher;
use crate::resolver::{DirectResolver, MediaResolver};
use crate::scheduler::Scheduler;
use crate::task::{DownloadRequest, TaskId, TaskState, TaskView};
use crate::worker::{self, TaskContext};

struct TaskEntry {
    request: DownloadRequest,
    publisher: Arc<TaskPublisher>,
    cancel: CancelToken,
    artifacts: Option<Arc<TempArtifactSet>>,
}

struct EngineState {
    scheduler: Scheduler,
    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    shutting_down: bool,
}

struct Shared {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn MediaResolver>,
    credentials: Arc<dyn CredentialProvider>,
    net: Arc<dyn NetClient>,
    muxer: Arc<dyn Muxer>,
    events: Arc<dyn EventSink>,
    state: Mutex<EngineState>,
    settled: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`DownloadEngine`], replacing any of the default collaborators.
///
/// Defaults: a reqwest client, [`DirectResolver`], no credentials, ffmpeg from
/// `EngineConfig::ffmpeg_path` and a sink that drops events.
pub struct EngineBuilder {
    config: EngineConfig,
    resolver: Option<Arc<dyn MediaResolver>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    net: Option<Arc<dyn NetClient>>,
    muxer: Option<Arc<dyn Muxer>>,
    events: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    pub fn with_resolver(mut self, resolver: Arc<dyn MediaResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = Some(net);
        self
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> CoreResult<DownloadEngine> {
        self.config.validate()?;
        let net: Arc<dyn NetClient> = match self.net {
            Some(net) => net,
            None => Arc::new(ReqwestNetClient::new(&self.config)?),
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(DirectResolver::new(Arc::clone(&net))));
        let muxer = self
            .muxer
            .unwrap_or_else(|| Arc::new(FfmpegMuxer::new(self.config.ffmpeg_path.clone())));
        let state = EngineState::new(self.config.max_concurrent_tasks);
        Ok(DownloadEngine {
            shared: Arc::new(Shared {
                config: Arc::new(self.config),
                resolver,
                credentials: self.credentials.unwrap_or_else(|| Arc::new(NoCredentials)),
                net,
                muxer,
                events: self.events.unwrap_or_else(|| Arc::new(NullSink)),
                state: Mutex::new(state),
                settled: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Accepts download requests and runs at most `max_concurrent_tasks` of them
/// at once, admitting waiting tasks in submission order.
///
/// Every method returns promptly; downloads run on one worker thread per
/// admitted task. Dropping the engine shuts it down.
pub struct DownloadEngine {
    shared: Arc<Shared>,
}

impl DownloadEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            resolver: None,
            credentials: None,
            net: None,
            muxer: None,
            events: None,
        }
    }

    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Validates and enqueues a request. The task starts as soon as a slot is free.
    pub fn submit(&self, request: DownloadRequest) -> CoreResult<TaskId> {
        request.validate()?;
        if self.shared.lock_state()?.shutting_down {
            return Err(CoreError::InvalidState("engine is shutting down".to_string()));
        }
        let id = Uuid::new_v4();
        let publisher = Arc::new(TaskPublisher::new(
            TaskView::queued(id, &request),
            Arc::clone(&self.shared.events),
        ));
        // Created goes out before the task can be admitted, so it is always first.
        publisher.announce();
        {
            let mut state = self.shared.lock_state()?;
            if state.shutting_down {
                drop(state);
                publisher.cancelled();
                return Err(CoreError::InvalidState("engine is shutting down".to_string()));
            }
            state.tasks.insert(
                id,
                TaskEntry {
                    request,
                    publisher,
                    cancel: CancelToken::new(),
                    artifacts: None,
                },
            );
            state.order.push(id);
            state.scheduler.enqueue(id);
        }
        info!(task = %id, "task submitted");
        self.shared.pump();
        Ok(id)
    }

    /// Requests cancellation.
    ///
    /// A queued task is cancelled on the spot and never starts. An active task
    /// is signalled and stops at its next chunk or step boundary. Returns
    /// `false` for unknown ids and for tasks that already completed or failed.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let Ok(mut state) = self.shared.lock_state() else {
            return false;
        };
        let was_queued = state.scheduler.cancel_queued(id);
        let Some(entry) = state.tasks.get(id) else {
            return false;
        };
        let publisher = Arc::clone(&entry.publisher);
        if was_queued {
            drop(state);
            publisher.cancelled();
            info!(task = %id, "queued task cancelled");
            self.shared.notify_settled();
            return true;
        }
        match publisher.state() {
            TaskState::Completed | TaskState::Failed => false,
            TaskState::Cancelled => true,
            _ => {
                entry.cancel.cancel();
                debug!(task = %id, "cancellation signalled");
                true
            }
        }
    }

    /// The latest published progress of a task. Never waits on a download.
    pub fn snapshot(&self, id: &TaskId) -> CoreResult<ProgressSnapshot> {
        Ok(self.publisher(id)?.view().progress.clone())
    }

    pub fn task(&self, id: &TaskId) -> CoreResult<TaskView> {
        Ok((*self.publisher(id)?.view()).clone())
    }

    /// All tasks in submission order.
    pub fn list(&self) -> Vec<TaskView> {
        let publishers: Vec<Arc<TaskPublisher>> = match self.shared.lock_state() {
            Ok(state) => state
                .order
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .map(|entry| Arc::clone(&entry.publisher))
                .collect(),
            Err(_) => Vec::new(),
        };
        publishers
            .iter()
            .map(|publisher| (*publisher.view()).clone())
            .collect()
    }

    pub fn queue_position(&self, id: &TaskId) -> Option<usize> {
        self.shared.lock_state().ok()?.scheduler.queue_position(id)
    }

    /// Blocks until the task is terminal or `timeout` passes; `Ok(None)` on timeout.
    pub fn wait_for(&self, id: &TaskId, timeout: Duration) -> CoreResult<Option<TaskState>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state()?;
        loop {
            let current = state
                .tasks
                .get(id)
                .map(|entry| entry.publisher.state())
                .ok_or(CoreError::TaskNotFound(*id))?;
            if current.is_terminal() {
                return Ok(Some(current));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .map_err(|_| CoreError::Poisoned("engine state"))?
                .0;
        }
    }

    /// Blocks until nothing is queued or running, then joins finished workers.
    pub fn wait_all(&self) -> CoreResult<()> {
        {
            let mut state = self.shared.lock_state()?;
            while !state.is_idle() {
                state = self
                    .shared
                    .settled
                    .wait(state)
                    .map_err(|_| CoreError::Poisoned("engine state"))?;
            }
        }
        self.shared.reap_handles(true);
        Ok(())
    }

    /// Stops accepting work, cancels everything queued or running and waits
    /// up to `shutdown_grace_ms` for workers to clean up. Idempotent.
    pub fn shutdown(&self) {
        let (queued, active) = {
            let Ok(mut state) = self.shared.lock_state() else {
                return;
            };
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            let queued = state.scheduler.drain_queued();
            let active = state.scheduler.active_ids();
            let queued: Vec<Arc<TaskPublisher>> = queued
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .map(|entry| Arc::clone(&entry.publisher))
                .collect();
            let active: Vec<(CancelToken, Option<Arc<TempArtifactSet>>)> = active
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .map(|entry| (entry.cancel.clone(), entry.artifacts.clone()))
                .collect();
            (queued, active)
        };
        info!(queued = queued.len(), active = active.len(), "shutting down");
        for publisher in &queued {
            publisher.cancelled();
        }
        for (cancel, _) in &active {
            cancel.cancel();
        }
        self.shared.notify_settled();

        let deadline = Instant::now() + self.shared.config.shutdown_grace();
        if let Ok(mut state) = self.shared.lock_state() {
            while !state.is_idle() {
                let now = Instant::now();
                if now >= deadline {
                    warn!("workers still running after shutdown grace period");
                    break;
                }
                match self.shared.settled.wait_timeout(state, deadline - now) {
                    Ok((next, _)) => state = next,
                    Err(_) => return,
                }
            }
        }
        // Workers that missed the grace period still hold their sets; release
        // now and let the last writer finish the deletion.
        for (_, artifacts) in &active {
            if let Some(artifacts) = artifacts {
                artifacts.release();
            }
        }
        self.shared.reap_handles(false);
    }

    /// Removes temp directories a previous process left in `dir`.
    pub fn sweep_stale_temp(&self, dir: &Path) -> CoreResult<usize> {
        let removed = sweep_stale(dir)?;
        if removed > 0 {
            info!(dir = %dir.display(), removed, "swept stale temp dirs");
        }
        Ok(removed)
    }

    fn publisher(&self, id: &TaskId) -> CoreResult<Arc<TaskPublisher>> {
        let state = self.shared.lock_state()?;
        state
            .tasks
            .get(id)
            .map(|entry| Arc::clone(&entry.publisher))
            .ok_or(CoreError::TaskNotFound(*id))
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineState {
    fn new(max_active: usize) -> Self {
        Self {
            scheduler: Scheduler::new(max_active),
            tasks: HashMap::new(),
            order: Vec::new(),
            shutting_down: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }
}

impl Shared {
    fn lock_state(&self) -> CoreResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Poisoned("engine state"))
    }

    fn notify_settled(&self) {
        // Taking the lock orders the wakeup after any waiter's state check.
        let _state = self.state.lock();
        self.settled.notify_all();
    }

    /// Admits waiting tasks while slots are free and starts their workers.
    fn pump(self: &Arc<Self>) {
        let admitted: Vec<TaskContext> = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if state.shutting_down {
                return;
            }
            let mut admitted = Vec::new();
            loop {
                let Some(id) = state.scheduler.admit_next() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&id) else {
                    continue;
                };
                let temp_parent = self
                    .config
                    .temp_root
                    .clone()
                    .unwrap_or_else(|| entry.request.target_dir.clone());
                let artifacts = TempArtifactSet::new(id, &temp_parent);
                entry.artifacts = Some(Arc::clone(&artifacts));
                admitted.push(TaskContext {
                    id,
                    request: entry.request.clone(),
                    config: Arc::clone(&self.config),
                    resolver: Arc::clone(&self.resolver),
                    credentials: Arc::clone(&self.credentials),
                    net: Arc::clone(&self.net),
                    muxer: Arc::clone(&self.muxer),
                    cancel: entry.cancel.clone(),
                    artifacts,
                    publisher: Arc::clone(&entry.publisher),
                });
            }
            admitted
        };
        for ctx in admitted {
            self.spawn_worker(ctx);
        }
    }

    fn spawn_worker(self: &Arc<Self>, ctx: TaskContext) {
        let id = ctx.id;
        let shared = Arc::clone(self);
        let fallback = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("mediagrab-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker::run(&ctx)));
                if outcome.is_err() {
                    error!(task = %ctx.id, "worker panicked");
                    ctx.artifacts.release();
                    let _ = ctx.publisher.transition(TaskState::Resolving);
                    ctx.publisher
                        .fail(&CoreError::InvalidState("worker panicked".to_string()));
                }
                shared.on_finished(&ctx.id);
            });
        match spawned {
            Ok(handle) => {
                debug!(task = %id, "worker started");
                self.reap_handles(false);
                if let Ok(mut handles) = self.handles.lock() {
                    handles.push(handle);
                }
            }
            Err(err) => {
                error!(task = %id, error = %err, "failed to start worker");
                fallback.artifacts.release();
                let _ = fallback.publisher.transition(TaskState::Resolving);
                fallback.publisher.fail(&CoreError::Io(err));
                self.on_finished(&id);
            }
        }
    }

    /// Frees the slot of a finished task, wakes waiters and admits the next one.
    fn on_finished(self: &Arc<Self>, id: &TaskId) {
        if let Ok(mut state) = self.lock_state() {
            state.scheduler.finish(id);
            if let Some(entry) = state.tasks.get_mut(id) {
                entry.artifacts = None;
            }
            self.settled.notify_all();
        }
        self.pump();
    }

    fn reap_handles(&self, all: bool) {
        let finished: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => {
                let mut finished = Vec::new();
                let mut index = 0usize;
                while index < handles.len() {
                    if all || handles[index].is_finished() {
                        finished.push(handles.remove(index));
                    } else {
                        index += 1;
                    }
                }
                finished
            }
            Err(_) => return,
        };
        for handle in finished {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }
}
