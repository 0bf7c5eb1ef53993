//! Handles onto tasks: released and unreleased treetures, task references
//! and dependency sets.

use crate::family::TaskFamily;
use crate::path::TaskPath;
use crate::runtime;
use crate::task::{State, Task};
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A reference onto a position inside a task family, used to synchronize on
/// (parts of) a task without holding the task itself.
///
/// The reference addresses a node of the family's conceptual binary tree; the
/// node may or may not ever materialize as an actual task. If it never does,
/// completion of the covering ancestor satisfies the reference.
#[derive(Clone)]
pub struct TaskReference {
    family: Option<Arc<TaskFamily>>,
    path: TaskPath,
}

impl TaskReference {
    pub(crate) fn of_task(task: &Task) -> TaskReference {
        let family = task.family();
        assert!(family.is_some(), "cannot reference an orphan task");
        TaskReference {
            family,
            path: task.path(),
        }
    }

    /// Whether the referenced position has completed. A reference without a
    /// family is trivially done.
    pub fn is_done(&self) -> bool {
        match &self.family {
            None => true,
            Some(family) => family.is_complete(self.path),
        }
    }

    /// Spins the calling worker's scheduler until the referenced position is
    /// done.
    pub fn wait(&self) {
        while !self.is_done() {
            runtime::current_worker().schedule_step();
        }
    }

    /// Reference onto the left child position.
    pub fn left(&self) -> TaskReference {
        TaskReference {
            family: self.family.clone(),
            path: self.path.left(),
        }
    }

    /// Reference onto the right child position.
    pub fn right(&self) -> TaskReference {
        TaskReference {
            family: self.family.clone(),
            path: self.path.right(),
        }
    }

    /// Narrows this reference onto its left child position in place.
    pub fn descend_left(&mut self) -> &mut TaskReference {
        self.path = self.path.left();
        self
    }

    /// Narrows this reference onto its right child position in place.
    pub fn descend_right(&mut self) -> &mut TaskReference {
        self.path = self.path.right();
        self
    }

    pub fn path(&self) -> TaskPath {
        self.path
    }

    pub(crate) fn family_handle(&self) -> Option<&Arc<TaskFamily>> {
        self.family.as_ref()
    }
}

impl fmt::Debug for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.family {
            Some(family) => write!(f, "TaskReference({}.{})", family.id(), self.path),
            None => write!(f, "TaskReference(done)"),
        }
    }
}

/// A set of predecessors a task has to wait for. Almost always tiny, so the
/// references are kept inline.
#[derive(Default)]
pub struct Dependencies {
    refs: SmallVec<[TaskReference; 4]>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn add(&mut self, reference: TaskReference) {
        self.refs.push(reference);
    }

    /// Builder-style variant of [`add`](Self::add).
    pub fn and(mut self, reference: impl Into<TaskReference>) -> Self {
        self.refs.push(reference.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskReference> {
        self.refs.iter()
    }
}

impl FromIterator<TaskReference> for Dependencies {
    fn from_iter<I: IntoIterator<Item = TaskReference>>(iter: I) -> Self {
        Dependencies {
            refs: iter.into_iter().collect(),
        }
    }
}

impl Extend<TaskReference> for Dependencies {
    fn extend<I: IntoIterator<Item = TaskReference>>(&mut self, iter: I) {
        self.refs.extend(iter);
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.refs.iter()).finish()
    }
}

/// Handle onto a released, possibly still running task computing a `T`.
///
/// `wait` blocks the calling thread productively (it keeps executing other
/// tasks); `get` waits and then moves the computed value out.
pub struct Treeture<T> {
    task: Arc<Task>,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Treeture<T> {
    pub(crate) fn of(task: Arc<Task>) -> Self {
        Treeture {
            task,
            _result: PhantomData,
        }
    }

    /// Blocks until the task is done, executing other tasks meanwhile.
    pub fn wait(&self) {
        self.task.wait();
    }

    /// Waits for completion and returns the computed value.
    pub fn get(self) -> T {
        self.task.wait();
        let value = self
            .task
            .take_value()
            .expect("task value already consumed");
        *value
            .downcast::<T>()
            .expect("task produced a value of an unexpected type")
    }

    /// Reference onto the left subtree of this task's (future) split tree.
    pub fn left(&self) -> TaskReference {
        let mut reference = TaskReference::of_task(&self.task);
        reference.descend_left();
        reference
    }

    /// Reference onto the right subtree of this task's (future) split tree.
    pub fn right(&self) -> TaskReference {
        let mut reference = TaskReference::of_task(&self.task);
        reference.descend_right();
        reference
    }

    pub fn task_reference(&self) -> TaskReference {
        TaskReference::of_task(&self.task)
    }
}

impl<T: Send + 'static> From<&Treeture<T>> for TaskReference {
    fn from(treeture: &Treeture<T>) -> TaskReference {
        treeture.task_reference()
    }
}

impl<T> fmt::Debug for Treeture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Treeture({:?})", self.task)
    }
}

/// Staging handle for a task that has not been handed to the runtime yet.
///
/// Consuming it either releases the task for execution or extracts the task
/// for composition into a bigger tree. Dropping an unreleased treeture
/// without doing either is a usage error.
pub struct UnreleasedTreeture<T> {
    task: Option<Arc<Task>>,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> UnreleasedTreeture<T> {
    pub(crate) fn of(task: Arc<Task>) -> Self {
        UnreleasedTreeture {
            task: Some(task),
            _result: PhantomData,
        }
    }

    /// Hands the task to the runtime and returns the released handle.
    pub fn release(mut self) -> Treeture<T> {
        let task = self.task.take().expect("task already extracted");
        if !task.is_done() {
            task.start();
        }
        Treeture::of(task)
    }

    /// Shorthand for `release().get()`.
    pub fn get(self) -> T {
        self.release().get()
    }

    /// Extracts the task for composition. The caller takes over the release
    /// obligation.
    pub(crate) fn into_task(mut self) -> Arc<Task> {
        self.task.take().expect("task already extracted")
    }
}

impl<T> fmt::Debug for UnreleasedTreeture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(f, "UnreleasedTreeture({:?})", task),
            None => write!(f, "UnreleasedTreeture(consumed)"),
        }
    }
}

impl<T> Drop for UnreleasedTreeture<T> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            if task.get_state() == State::New && !std::thread::panicking() {
                panic!("unreleased treeture dropped without being released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::create_family;
    use crate::path::TaskPath;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskReference: Send, Sync);
    assert_impl_all!(Dependencies: Send, Sync);
    assert_impl_all!(Treeture<i32>: Send, Sync);
    assert_impl_all!(UnreleasedTreeture<i32>: Send, Sync);

    #[test]
    fn test_reference_without_family_is_done() {
        let reference = TaskReference {
            family: None,
            path: TaskPath::root(),
        };
        assert!(reference.is_done());
        assert!(reference.left().is_done());
    }

    #[test]
    fn test_reference_follows_family_completion() {
        let family = create_family();
        let reference = TaskReference {
            family: Some(family.clone()),
            path: TaskPath::root(),
        };

        let mut narrowed = reference.clone();
        narrowed.descend_left().descend_right();
        assert!(!narrowed.is_done());

        // ancestor completion covers every descendant position
        family.mark_done(TaskPath::root());
        assert!(narrowed.is_done());
        assert!(reference.is_done());
        // done stays done
        assert!(narrowed.is_done());
    }

    #[test]
    fn test_dependencies_builder() {
        let family = create_family();
        let reference = TaskReference {
            family: Some(family),
            path: TaskPath::root(),
        };

        let deps = Dependencies::default().and(reference.clone()).and(reference);
        assert_eq!(deps.len(), 2);
        assert!(!deps.is_empty());
        assert!(Dependencies::default().is_empty());
    }

    #[test]
    #[should_panic(expected = "unreleased treeture dropped")]
    fn test_dropping_unreleased_treeture_panics() {
        let task = Task::leaf(Box::new(|| Box::new(0i32) as _));
        let _treeture = UnreleasedTreeture::<i32>::of(task);
    }

    #[test]
    fn test_waiters_are_signalled_exactly_once() {
        let pool = crate::runtime::Builder::new().worker_threads(1).build();
        let family = create_family();
        let path = TaskPath::root().left();
        let reference = TaskReference {
            family: Some(family.clone()),
            path,
        };

        let task = Task::leaf(Box::new(|| Box::new(()) as _));
        let deps = Dependencies::default().and(reference);
        task.add_dependencies(&deps);
        // one synthetic release dependency plus the registered one
        assert_eq!(task.active_dependency_count(), 2);

        family.mark_done(path);
        assert_eq!(task.active_dependency_count(), 1);

        // repeated completion of the same path must not signal again
        family.mark_done(path);
        assert_eq!(task.active_dependency_count(), 1);

        // neither does the ancestor's propagation into the same cell
        family.mark_done(TaskPath::root());
        assert_eq!(task.active_dependency_count(), 1);

        task.start();
        assert!(task.is_done());
        drop(pool);
    }

    #[test]
    fn test_dependency_on_done_path_signals_instantly() {
        let pool = crate::runtime::Builder::new().worker_threads(1).build();
        let family = create_family();
        let path = TaskPath::root().right();
        family.mark_done(path);

        let reference = TaskReference {
            family: Some(family),
            path,
        };
        assert!(reference.is_done());

        let task = Task::leaf(Box::new(|| Box::new(()) as _));
        let deps = Dependencies::default().and(reference);
        task.add_dependencies(&deps);
        // the completed reference was counted off during registration
        assert_eq!(task.active_dependency_count(), 1);

        task.start();
        assert!(task.is_done());
        drop(pool);
    }

    #[test]
    fn test_dependency_beyond_depth_bound_clamps_to_ancestor() {
        let pool = crate::runtime::Builder::new().worker_threads(1).build();
        let family = create_family();

        // a reference far below the completion table's depth bound
        let mut deep = TaskReference {
            family: Some(family.clone()),
            path: TaskPath::root(),
        };
        for _ in 0..9 {
            deep.descend_left();
        }

        let task = Task::leaf(Box::new(|| Box::new(()) as _));
        let deps = Dependencies::default().and(deep);
        task.add_dependencies(&deps);
        assert_eq!(task.active_dependency_count(), 2);

        // completing the root covers the clamped cell
        family.mark_done(TaskPath::root());
        assert_eq!(task.active_dependency_count(), 1);

        task.start();
        assert!(task.is_done());
        drop(pool);
    }
}
