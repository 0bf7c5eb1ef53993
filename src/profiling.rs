//! Scheduler event reporting for external profilers.
//!
//! The runtime itself does nothing with these events; a pool configured
//! without a sink pays a single branch per emission.

use crate::family::TaskId;
use parking_lot::Mutex;

/// Scheduling events emitted by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TaskStarted(TaskId),
    TaskEnded(TaskId),
    TaskStolen(TaskId),
    WorkerCreated { worker: usize },
    WorkerSuspended { worker: usize },
    WorkerResumed { worker: usize },
    WorkerDestroyed { worker: usize },
}

/// Receives scheduling events. Implementations must be cheap and
/// non-blocking; they are invoked from the middle of the scheduler loop.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// An [`EventSink`] collecting everything into memory, mainly useful for
/// tests and ad-hoc inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count<F: Fn(&Event) -> bool>(&self, predicate: F) -> usize {
        self.events.lock().iter().filter(|&e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
