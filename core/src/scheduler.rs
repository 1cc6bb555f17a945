use std::collections::HashSet;

use crate::queue::TaskQueue;
use crate::task::TaskId;

/// Admission bookkeeping: the waiting line plus the set of running tasks.
///
/// Holds no threads and no task data. The engine owns one behind its state
/// lock, so every admission decision is made under that single lock.
#[derive(Debug)]
pub struct Scheduler {
    pub max_active: usize,
    queue: TaskQueue,
    active: HashSet<TaskId>,
}

impl Scheduler {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            queue: TaskQueue::default(),
            active: HashSet::new(),
        }
    }

    pub fn can_start(&self) -> bool {
        self.active.len() < self.max_active
    }

    pub fn enqueue(&mut self, id: TaskId) {
        self.queue.push(id);
    }

    /// Moves the oldest waiting task into the active set when a slot is free.
    pub fn admit_next(&mut self) -> Option<TaskId> {
        if !self.can_start() {
            return None;
        }
        let id = self.queue.pop()?;
        self.active.insert(id);
        Some(id)
    }

    /// `true` when the task was still waiting and has now left the line.
    pub fn cancel_queued(&mut self, id: &TaskId) -> bool {
        self.queue.remove(id)
    }

    pub fn drain_queued(&mut self) -> Vec<TaskId> {
        self.queue.drain()
    }

    /// Frees the slot of a task that reached a terminal state.
    pub fn finish(&mut self, id: &TaskId) -> bool {
        self.active.remove(id)
    }

    pub fn queue_position(&self, id: &TaskId) -> Option<usize> {
        self.queue.position(id)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.active.iter().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }
}
