use crate::task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Per-worker double-ended queue of ready tasks.
///
/// The owning worker pushes and pops at the front end of its lifecycle
/// (push back, pop front); thieves take from the back. Both ends go through
/// the internal lock, contention is bounded by the pop/steal protocol.
pub(crate) struct WorkQueue {
    inner: Mutex<VecDeque<Arc<Task>>>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        WorkQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn push_back(&self, task: Arc<Task>) {
        self.inner.lock().push_back(task);
    }

    /// Owner end.
    pub(crate) fn pop_front(&self) -> Option<Arc<Task>> {
        self.inner.lock().pop_front()
    }

    /// Thief end.
    pub(crate) fn pop_back(&self) -> Option<Arc<Task>> {
        self.inner.lock().pop_back()
    }

    /// Copy of the current queue content, for state dumps.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Task>> {
        self.inner.lock().iter().cloned().collect()
    }
}
