//! Events emitted towards whatever presents task state.
//!
//! Lifecycle events are emitted as soon as the transition happens; progress
//! events at most at the aggregator's publish rate. Nothing for a task is
//! emitted after its terminal event.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::error::ErrorKind;
use crate::progress::ProgressSnapshot;
use crate::task::TaskId;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreated {
        id: TaskId,
        url: String,
    },
    TaskProgress {
        id: TaskId,
        snapshot: ProgressSnapshot,
    },
    TaskCompleted {
        id: TaskId,
        outputs: Vec<PathBuf>,
    },
    TaskFailed {
        id: TaskId,
        kind: ErrorKind,
        detail: String,
    },
    TaskCancelled {
        id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::TaskCreated { id, .. }
            | TaskEvent::TaskProgress { id, .. }
            | TaskEvent::TaskCompleted { id, .. }
            | TaskEvent::TaskFailed { id, .. }
            | TaskEvent::TaskCancelled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::TaskCompleted { .. }
                | TaskEvent::TaskFailed { .. }
                | TaskEvent::TaskCancelled { .. }
        )
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TaskEvent) {}
}

impl<F> EventSink for F
where
    F: Fn(TaskEvent) + Send + Sync,
{
    fn emit(&self, event: TaskEvent) {
        self(event)
    }
}

/// Forwards events over a channel; a dropped receiver silently stops delivery.
pub struct ChannelSink {
    sender: Mutex<Sender<TaskEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<TaskEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TaskEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}
