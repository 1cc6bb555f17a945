//! Per-task publication of state and progress.
//!
//! Readers get an `Arc<TaskView>` that is swapped whole on every change, so a
//! snapshot read never waits on a download. Writes are serialized through one
//! publish lock, which also fixes the order events reach the sink. After the
//! terminal event the publisher is sealed and drops everything else.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, TaskEvent};
use crate::progress::ProgressSnapshot;
use crate::task::{TaskFailure, TaskId, TaskState, TaskView};

pub struct TaskPublisher {
    id: TaskId,
    view: RwLock<Arc<TaskView>>,
    publish_lock: Mutex<()>,
    sink: Arc<dyn EventSink>,
}

impl TaskPublisher {
    pub fn new(view: TaskView, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: view.id,
            view: RwLock::new(Arc::new(view)),
            publish_lock: Mutex::new(()),
            sink,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn view(&self) -> Arc<TaskView> {
        match self.view.read() {
            Ok(view) => Arc::clone(&*view),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn state(&self) -> TaskState {
        self.view().state
    }

    pub fn announce(&self) {
        let view = self.view();
        self.sink.emit(TaskEvent::TaskCreated {
            id: self.id,
            url: view.url.clone(),
        });
    }

    /// Moves to a non-terminal state and publishes the carried-over progress.
    pub fn transition(&self, next: TaskState) -> CoreResult<()> {
        let _guard = self.lock()?;
        let current = self.view();
        if !current.state.can_transition_to(next) || next.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "task {} cannot move from {} to {}",
                self.id, current.state, next
            )));
        }
        let mut view = (*current).clone();
        view.state = next;
        view.progress = current.progress.with_state(next);
        let snapshot = view.progress.clone();
        self.swap(view);
        debug!(task = %self.id, from = %current.state, to = %next, "state changed");
        self.sink.emit(TaskEvent::TaskProgress {
            id: self.id,
            snapshot,
        });
        Ok(())
    }

    pub fn set_item_count(&self, count: usize) {
        let Ok(_guard) = self.lock() else {
            return;
        };
        let mut view = (*self.view()).clone();
        view.item_count = count;
        self.swap(view);
    }

    /// Publishes a progress snapshot; ignored once the task has left `Downloading`.
    pub fn progress(&self, snapshot: ProgressSnapshot) {
        let Ok(_guard) = self.lock() else {
            return;
        };
        let current = self.view();
        if current.state != TaskState::Downloading {
            return;
        }
        let mut view = (*current).clone();
        view.progress = snapshot.clone();
        self.swap(view);
        self.sink.emit(TaskEvent::TaskProgress {
            id: self.id,
            snapshot,
        });
    }

    pub fn complete(&self, outputs: Vec<PathBuf>) -> bool {
        self.finish(TaskState::Completed, |view| {
            view.outputs = outputs.clone();
            TaskEvent::TaskCompleted {
                id: view.id,
                outputs,
            }
        })
    }

    pub fn fail(&self, err: &CoreError) -> bool {
        let failure = TaskFailure::from_error(err);
        self.finish(TaskState::Failed, |view| {
            view.failure = Some(failure.clone());
            TaskEvent::TaskFailed {
                id: view.id,
                kind: failure.kind,
                detail: failure.detail,
            }
        })
    }

    pub fn cancelled(&self) -> bool {
        self.finish(TaskState::Cancelled, |view| TaskEvent::TaskCancelled { id: view.id })
    }

    /// Publishes the terminal state once. Returns `false` if the task was
    /// already terminal or the transition is not allowed from where it is.
    fn finish<F>(&self, next: TaskState, build: F) -> bool
    where
        F: FnOnce(&mut TaskView) -> TaskEvent,
    {
        let Ok(_guard) = self.lock() else {
            return false;
        };
        let current = self.view();
        if current.state.is_terminal() {
            return false;
        }
        if !current.state.can_transition_to(next) {
            warn!(task = %self.id, from = %current.state, to = %next, "ignored terminal transition");
            return false;
        }
        let mut view = (*current).clone();
        view.state = next;
        view.progress = current.progress.with_state(next);
        let event = build(&mut view);
        self.swap(view);
        match &event {
            TaskEvent::TaskFailed { kind, detail, .. } => {
                warn!(task = %self.id, kind = %kind, detail = %detail, "task failed")
            }
            _ => info!(task = %self.id, state = %next, "task finished"),
        }
        self.sink.emit(event);
        true
    }

    fn swap(&self, view: TaskView) {
        match self.view.write() {
            Ok(mut slot) => *slot = Arc::new(view),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(view),
        }
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, ()>> {
        self.publish_lock
            .lock()
            .map_err(|_| CoreError::Poisoned("task publisher"))
    }
}
