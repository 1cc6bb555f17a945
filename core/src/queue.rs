use std::collections::VecDeque;

use crate::task::TaskId;

/// Admission order of waiting tasks. Strictly first in, first out.
#[derive(Debug, Default)]
pub struct TaskQueue {
    items: VecDeque<TaskId>,
}

impl TaskQueue {
    pub fn push(&mut self, id: TaskId) {
        if !self.items.contains(&id) {
            self.items.push_back(id);
        }
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.items.pop_front()
    }

    /// Takes a task out of line; `false` when it was not waiting.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.items.iter().position(|queued| queued == id) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    /// Zero-based place in line.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.items.iter().position(|queued| queued == id)
    }

    pub fn drain(&mut self) -> Vec<TaskId> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
