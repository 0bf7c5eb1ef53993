use crate::dependency::DependencyManager;
use crate::path::TaskPath;
use crate::task::Task;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a task as a position inside a family's conceptual tree.
///
/// The id is stable once the task has been adopted into a family. Orphan
/// tasks render with family id 0; their ids are meaningful for debug output
/// only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    family: u64,
    path: TaskPath,
}

impl TaskId {
    pub(crate) fn new(family: u64, path: TaskPath) -> Self {
        TaskId { family, path }
    }

    pub(crate) fn orphan() -> Self {
        TaskId {
            family: 0,
            path: TaskPath::root(),
        }
    }

    pub fn family(&self) -> u64 {
        self.family
    }

    pub fn path(&self) -> TaskPath {
        self.path
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.family, self.path)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A group of tasks descending from a common root.
///
/// A family is created for every root-level release; tasks produced by
/// splitting are adopted into the family of the task they replace. The
/// family owns the completion table all [`TaskReference`] synchronization
/// goes through.
///
/// [`TaskReference`]: crate::treeture::TaskReference
pub struct TaskFamily {
    id: u64,
    dependencies: DependencyManager,
}

impl TaskFamily {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Tests whether the sub-task at `path` has completed.
    pub(crate) fn is_complete(&self, path: TaskPath) -> bool {
        self.dependencies.is_complete(path)
    }

    /// Registers `task` as blocked on the completion of `path`.
    pub(crate) fn add_dependency(&self, task: Arc<Task>, path: TaskPath) {
        self.dependencies.add_dependency(task, path);
    }

    /// Marks the sub-task at `path` as finished, waking its waiters.
    pub(crate) fn mark_done(&self, path: TaskPath) {
        self.dependencies.mark_complete(path);
    }
}

impl fmt::Debug for TaskFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFamily").field("id", &self.id).finish()
    }
}

/// Allocates a fresh family with a process-unique id. Id 0 is reserved for
/// orphans.
pub(crate) fn create_family() -> Arc<TaskFamily> {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    Arc::new(TaskFamily {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        dependencies: DependencyManager::new(),
    })
}
