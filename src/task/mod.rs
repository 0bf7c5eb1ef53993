//! The task node: state machine, split/substitute protocol, and completion
//! notification.
//!
//! A task is co-owned by everybody holding a handle onto it (treetures,
//! family waiter lists, parent links, worker queues). The parent back-pointer
//! is weak; the protocol guarantees the parent outlives the child because a
//! parent only reaches `Done` after observing `child_done` for all children.

use crate::family::{TaskFamily, TaskId};
use crate::path::TaskPath;
use crate::runtime::{self, TOP_LEVEL_CUTOFF_DEPTH};
use crate::treeture::Dependencies;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

mod state;
pub use state::State;
use state::AtomicState;

/// Type-erased task result. Typed access happens at the treeture layer.
pub(crate) type BoxedValue = Box<dyn Any + Send>;

/// A leaf computation producing the task's value.
pub(crate) type BodyFn = Box<dyn FnOnce() -> BoxedValue + Send>;

/// A decomposition producing the substitute task for a splittable leaf.
pub(crate) type DecomposeFn = Box<dyn FnOnce() -> Arc<Task> + Send>;

/// Combines the two child values of a split task.
pub(crate) type MergeFn = Box<dyn FnOnce(BoxedValue, BoxedValue) -> BoxedValue + Send>;

/// The work carried by a task. Closures are consumed exactly once; the
/// variants keep them in `Option`s so the protocol can take them out from
/// behind the shared handle.
enum Work {
    /// Constructed in the `Done` state with a preset value.
    Completed,
    Leaf {
        body: Option<BodyFn>,
    },
    Splittable {
        body: Option<BodyFn>,
        decompose: Option<DecomposeFn>,
    },
    Split {
        merge: Option<MergeFn>,
    },
}

/// Family membership. Written once during adoption, read-only afterwards.
struct Membership {
    family: Option<Arc<TaskFamily>>,
    path: TaskPath,
}

/// Tree links. `left`/`right` are set at construction, `substitute` and
/// `parent` at most once during the protocol; `finish` clears all of them
/// exactly once.
#[derive(Default)]
struct Links {
    left: Option<Arc<Task>>,
    right: Option<Arc<Task>>,
    substitute: Option<Arc<Task>>,
    parent: Option<Weak<Task>>,
}

pub(crate) struct Task {
    membership: RwLock<Membership>,

    state: AtomicState,

    /// Outstanding dependencies plus one synthetic release dependency that
    /// holds the task in `Blocked` until `start` runs. The count can be
    /// driven below zero by late completions racing a substitution; those
    /// are forgiven (see `dependency_done`).
    num_active_dependencies: AtomicI64,

    /// Whether the scheduler may still ask this task to decompose itself.
    splittable: AtomicBool,

    /// Children of a parallel split run concurrently; a sequential split
    /// drives left to completion before starting right.
    parallel: bool,

    links: Mutex<Links>,

    /// Children of a split task still alive. Drives `finish` from the last
    /// `child_done` callback.
    alive_children: AtomicU32,

    /// Sticky marker that a substitute took over, kept after the substitute
    /// link itself is cleared on completion.
    substituted: AtomicBool,

    work: Mutex<Work>,

    value: Mutex<Option<BoxedValue>>,
}

// -- construction --

impl Task {
    fn new(state: State, work: Work, links: Links, parallel: bool, splittable: bool) -> Arc<Task> {
        Arc::new(Task {
            membership: RwLock::new(Membership {
                family: None,
                path: TaskPath::root(),
            }),
            state: AtomicState::new(state),
            num_active_dependencies: AtomicI64::new(1),
            splittable: AtomicBool::new(splittable),
            parallel,
            links: Mutex::new(links),
            alive_children: AtomicU32::new(0),
            substituted: AtomicBool::new(false),
            work: Mutex::new(work),
            value: Mutex::new(None),
        })
    }

    /// A task born in the `Done` state carrying `value`.
    pub(crate) fn completed(value: BoxedValue) -> Arc<Task> {
        let task = Self::new(State::Done, Work::Completed, Links::default(), false, false);
        *task.value.lock() = Some(value);
        task
    }

    /// A plain leaf task.
    pub(crate) fn leaf(body: BodyFn) -> Arc<Task> {
        Self::new(
            State::New,
            Work::Leaf { body: Some(body) },
            Links::default(),
            false,
            false,
        )
    }

    /// A leaf task that knows how to decompose itself.
    pub(crate) fn splittable(body: BodyFn, decompose: DecomposeFn) -> Arc<Task> {
        Self::new(
            State::New,
            Work::Splittable {
                body: Some(body),
                decompose: Some(decompose),
            },
            Links::default(),
            false,
            true,
        )
    }

    /// An internal task whose result is the composition of two children.
    pub(crate) fn composed(
        left: Arc<Task>,
        right: Arc<Task>,
        merge: Option<MergeFn>,
        parallel: bool,
    ) -> Arc<Task> {
        Self::new(
            State::New,
            Work::Split { merge },
            Links {
                left: Some(left),
                right: Some(right),
                substitute: None,
                parent: None,
            },
            parallel,
            false,
        )
    }
}

// -- observers --

impl Task {
    pub(crate) fn family(&self) -> Option<Arc<TaskFamily>> {
        self.membership.read().family.clone()
    }

    pub(crate) fn path(&self) -> TaskPath {
        self.membership.read().path
    }

    pub(crate) fn id(&self) -> TaskId {
        let m = self.membership.read();
        match &m.family {
            Some(family) => TaskId::new(family.id(), m.path),
            None => TaskId::new(0, m.path),
        }
    }

    pub(crate) fn is_orphan(&self) -> bool {
        self.membership.read().family.is_none()
    }

    pub(crate) fn depth(&self) -> usize {
        self.membership.read().path.len()
    }

    /// The externally observable state. A substitute takes over reporting
    /// until the replaced task finishes.
    pub(crate) fn get_state(&self) -> State {
        if let Some(sub) = self.links.lock().substitute.clone() {
            return sub.state.load();
        }
        self.state.load()
    }

    /// Completion is always judged on the task's own state; the substitute
    /// drives it there through `child_done`.
    pub(crate) fn is_done(&self) -> bool {
        self.state.load() == State::Done
    }

    pub(crate) fn is_ready(&self) -> bool {
        if let Some(sub) = self.links.lock().substitute.clone() {
            return sub.is_ready();
        }
        self.state.load() == State::Ready
    }

    pub(crate) fn is_split(&self) -> bool {
        self.links.lock().left.is_some()
    }

    pub(crate) fn is_splittable(&self) -> bool {
        self.splittable.load(Ordering::Acquire)
    }

    pub(crate) fn is_substituted(&self) -> bool {
        self.substituted.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn active_dependency_count(&self) -> i64 {
        self.num_active_dependencies.load(Ordering::Acquire)
    }

    /// Moves the produced value out. Only valid once the task is done.
    pub(crate) fn take_value(&self) -> Option<BoxedValue> {
        debug_assert!(self.is_done());
        self.value.lock().take()
    }
}

// -- mutators --

impl Task {
    /// Registers the given predecessors. Already-completed references are
    /// counted off immediately; the rest are parked in their family's
    /// completion table.
    pub(crate) fn add_dependencies(self: &Arc<Task>, dependencies: &Dependencies) {
        if dependencies.is_empty() {
            return;
        }

        assert_eq!(
            self.get_state(),
            State::New,
            "dependencies may only be added before release"
        );

        self.num_active_dependencies
            .fetch_add(dependencies.len() as i64, Ordering::AcqRel);

        for dep in dependencies.iter() {
            if dep.is_done() {
                self.dependency_done();
                continue;
            }
            let family = dep
                .family_handle()
                .expect("pending dependency without a family");
            family.add_dependency(self.clone(), dep.path());
        }
    }

    /// Joins `family` at `path`, propagating to the substitute and both
    /// children. A task that already belongs to a family keeps it; recursive
    /// decompositions splice in subtrees that were rooted on their own.
    pub(crate) fn adopt(&self, family: &Arc<TaskFamily>, path: TaskPath) {
        {
            let mut m = self.membership.write();
            if m.family.is_some() {
                return;
            }
            m.family = Some(family.clone());
            m.path = path;
        }

        // a task adopted after completing still has to report itself
        if self.is_done() {
            family.mark_done(path);
        }

        let (sub, left, right) = {
            let links = self.links.lock();
            (
                links.substitute.clone(),
                links.left.clone(),
                links.right.clone(),
            )
        };
        if let Some(sub) = sub {
            sub.adopt(family, path);
        }
        if let Some(left) = left {
            left.adopt(family, path.left());
        }
        if let Some(right) = right {
            right.adopt(family, path.right());
        }
    }
}

// -- state transitions --

impl Task {
    fn set_state(&self, next: State) {
        assert!(
            next != State::Ready
                || self.num_active_dependencies.load(Ordering::Acquire) == 0
                || self.is_substituted(),
            "task released with active dependencies"
        );
        self.state.advance(next);
        trace!(task = %self.id(), state = %next, "task state");
    }

    /// New -> Blocked. Issued exactly once per task, at release time.
    /// Top-level splittable tasks near the root are decomposed eagerly,
    /// before the synthetic release dependency is counted off.
    pub(crate) fn start(self: &Arc<Task>) {
        assert_eq!(self.state.load(), State::New, "task started twice");
        self.set_state(State::Blocked);

        if !self.is_orphan() && self.is_splittable() && self.depth() < TOP_LEVEL_CUTOFF_DEPTH {
            self.split();
            if self.is_done() {
                return;
            }
        }

        // release the synthetic dependency
        self.dependency_done();
    }

    /// Counts off one completed dependency. The thread observing the drop to
    /// zero owns the Blocked -> Ready transition and places the task on a
    /// worker.
    pub(crate) fn dependency_done(self: &Arc<Task>) {
        let old = self.num_active_dependencies.fetch_sub(1, Ordering::AcqRel);

        if old < 1 {
            // late completions after a substitution forgave the count
            assert!(
                self.is_substituted(),
                "dependency count underflow on a task without substitute"
            );
            self.num_active_dependencies.store(0, Ordering::Release);
            return;
        }

        if old != 1 {
            return;
        }

        let state = self.state.load();
        assert_ne!(
            state,
            State::New,
            "a task must not lose its last dependency before release"
        );
        assert_eq!(state, State::Blocked);
        self.set_state(State::Ready);

        // Top-level tasks close to the root are spread deterministically
        // across the pool; everything else stays with the scheduling thread.
        let worker = runtime::current_worker();
        let depth = self.depth();
        if !self.is_orphan() && depth < TOP_LEVEL_CUTOFF_DEPTH {
            let num_workers = worker.shared().num_workers();
            let target = if depth == 0 {
                0
            } else {
                (self.path().as_int() as usize * num_workers) >> depth
            };
            worker.shared().worker(target).schedule(self.clone());
        } else {
            worker.schedule(self.clone());
        }
    }

    /// Ready -> Running -> ... -> Done. Leaves execute their body; split
    /// tasks drive their children and aggregate.
    pub(crate) fn run(self: &Arc<Task>) {
        // A substituted task is logically running its replacement; there is
        // nothing left to execute here, completion arrives via child_done.
        if self.is_substituted() {
            self.wait();
            assert_eq!(self.state.load(), State::Done);
            return;
        }

        trace!(task = %self.id(), "running task");
        assert_eq!(self.state.load(), State::Ready);
        assert_eq!(self.num_active_dependencies.load(Ordering::Acquire), 0);
        self.set_state(State::Running);

        let (left, right) = {
            let links = self.links.lock();
            (links.left.clone(), links.right.clone())
        };

        if let (Some(left), Some(right)) = (left, right) {
            self.run_split(left, right);
        } else {
            self.execute();
            self.finish();
        }
    }

    fn run_split(self: &Arc<Task>, left: Arc<Task>, right: Arc<Task>) {
        debug_assert!(matches!(left.state.load(), State::New | State::Done));
        debug_assert!(matches!(right.state.load(), State::New | State::Done));

        if !self.parallel {
            if left.state.load() == State::New {
                left.start();
            }
            left.wait();
            if right.state.load() == State::New {
                right.start();
            }
            right.wait();
            self.finish();
            return;
        }

        // The alive count must cover both children before either starts; a
        // fast child completes through child_done concurrently.
        debug_assert_eq!(self.alive_children.load(Ordering::Acquire), 0);
        let pending: Vec<Arc<Task>> = [left, right]
            .into_iter()
            .filter(|child| child.state.load() == State::New)
            .collect();

        if pending.is_empty() {
            self.finish();
            return;
        }

        self.alive_children
            .store(pending.len() as u32, Ordering::Release);

        for child in pending {
            child.links.lock().parent = Some(Arc::downgrade(self));
            child.start();
        }

        // the final child_done callback performs the finish
        self.wait();
        assert!(self.is_done());
    }

    /// Replaces this leaf by the task produced by its decomposition. Valid
    /// while Blocked or Ready, at most once.
    pub(crate) fn split(self: &Arc<Task>) {
        if !self.splittable.swap(false, Ordering::AcqRel) {
            return;
        }

        let state = self.state.load();
        assert!(
            state == State::Blocked || state == State::Ready,
            "cannot split a task in state {}",
            state
        );

        let decompose = match &mut *self.work.lock() {
            Work::Splittable { decompose, .. } => {
                decompose.take().expect("decomposition already consumed")
            }
            _ => unreachable!("split on a task without decomposition"),
        };

        trace!(task = %self.id(), "splitting task");
        let substitute = decompose();
        self.set_substitute(substitute);
    }

    fn set_substitute(self: &Arc<Task>, substitute: Arc<Task>) {
        let state = self.state.load();
        assert!(
            state == State::Blocked || state == State::Ready,
            "substitution in state {}",
            state
        );
        let sub_state = substitute.state.load();
        assert!(
            sub_state == State::New || sub_state == State::Done,
            "substitute must be new or already done, is {}",
            sub_state
        );

        // the substitute takes over this task's identity
        if let Some(family) = self.family() {
            substitute.adopt(&family, self.path());
        }

        {
            let mut links = self.links.lock();
            assert!(links.substitute.is_none(), "task substituted twice");
            substitute.links.lock().parent = Some(Arc::downgrade(self));
            links.substitute = Some(substitute.clone());
        }
        self.substituted.store(true, Ordering::Release);

        // The remaining dependencies were owed to the replaced body; the
        // decomposition ran with all predecessors complete.
        self.num_active_dependencies.store(0, Ordering::Release);

        if state == State::Blocked {
            self.set_state(State::Ready);
        }
        // the substitute may complete at any moment from here on
        self.set_state(State::Running);

        if substitute.is_done() {
            self.finish();
            assert_eq!(self.state.load(), State::Done);
        } else {
            substitute.start();
        }
    }

    /// Completion callback from the substitute or one of the children,
    /// distinguished by identity.
    fn child_done(&self, child: &Task) {
        let is_substitute = self
            .links
            .lock()
            .substitute
            .as_deref()
            .is_some_and(|sub| std::ptr::eq(sub, child));

        if is_substitute {
            let state = self.state.load();
            assert!(
                state == State::Ready || state == State::Running,
                "substitute completed while parent in state {}",
                state
            );
            self.finish();
            return;
        }

        assert_eq!(self.state.load(), State::Running);
        {
            let links = self.links.lock();
            let is_child = links
                .left
                .as_deref()
                .is_some_and(|l| std::ptr::eq(l, child))
                || links
                    .right
                    .as_deref()
                    .is_some_and(|r| std::ptr::eq(r, child));
            assert!(is_child, "completion notification from an unrelated task");
        }

        let old = self.alive_children.fetch_sub(1, Ordering::AcqRel);
        if old != 1 {
            return;
        }
        self.finish();
    }

    /// Running -> Aggregating -> Done. Collects the result, cuts the tree
    /// links loose, publishes completion to the family and notifies the
    /// parent exactly once.
    fn finish(&self) {
        trace!(task = %self.id(), "finishing task");
        self.set_state(State::Aggregating);
        self.aggregate();

        let parent = {
            let mut links = self.links.lock();
            links.left = None;
            links.right = None;
            links.substitute = None;
            links.parent.take()
        };

        self.set_state(State::Done);

        if let Some(family) = self.family() {
            family.mark_done(self.path());
        }

        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.child_done(self);
        }
    }

    /// Runs the leaf body and stores its value.
    fn execute(&self) {
        let body = match &mut *self.work.lock() {
            Work::Leaf { body } | Work::Splittable { body, .. } => body.take(),
            _ => None,
        };
        let body = body.expect("task body already consumed");
        // the body runs without holding any task lock, it may spawn freely
        let value = body();
        *self.value.lock() = Some(value);
    }

    /// Collects the result: from the substitute if one took over, otherwise
    /// by merging the children of a split task. Plain leaves stored their
    /// value in `execute` already.
    fn aggregate(&self) {
        let sub = self.links.lock().substitute.clone();
        if let Some(sub) = sub {
            *self.value.lock() = sub.take_value();
            return;
        }

        let (left, right) = {
            let links = self.links.lock();
            (links.left.clone(), links.right.clone())
        };
        if let (Some(left), Some(right)) = (left, right) {
            let merge = match &mut *self.work.lock() {
                Work::Split { merge } => merge.take(),
                _ => None,
            };
            let value = match merge {
                Some(merge) => {
                    let lv = left.take_value().expect("left child value missing");
                    let rv = right.take_value().expect("right child value missing");
                    merge(lv, rv)
                }
                None => Box::new(()) as BoxedValue,
            };
            *self.value.lock() = Some(value);
        }
    }

    /// Spins the calling worker's scheduler loop until this task is done,
    /// keeping the waiting thread productive.
    pub(crate) fn wait(&self) {
        assert_ne!(
            self.state.load(),
            State::New,
            "waiting on a task that was never released"
        );
        while !self.is_done() {
            runtime::current_worker().schedule_step();
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let links = self.links.lock();

        if let Some(sub) = &links.substitute {
            return write!(f, "{} -> {}", self.id(), sub);
        }

        if let (Some(left), Some(right)) = (&links.left, &links.right) {
            return write!(
                f,
                "{} : {} = [{},{}]",
                self.id(),
                self.state.load(),
                left,
                right
            );
        }
        drop(links);

        let state = self.state.load();
        write!(f, "{} : {}", self.id(), state)?;

        let mut pending = self.num_active_dependencies.load(Ordering::Acquire);
        if state == State::New {
            // discount the synthetic release dependency
            pending -= 1;
        }
        if pending > 0 {
            write!(f, " waiting for {} task(s)", pending)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.is_done(),
                "task {} destroyed in state {}",
                self.id(),
                self.state.load()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::create_family;

    fn force_done(task: &Task) {
        let mut state = task.state.load();
        while state != State::Done {
            let next = match state {
                State::New => State::Blocked,
                State::Blocked => State::Ready,
                State::Ready => State::Running,
                State::Running => State::Aggregating,
                State::Aggregating => State::Done,
                State::Done => unreachable!(),
            };
            task.state.advance(next);
            state = next;
        }
    }

    #[test]
    fn test_completed_task_is_done() {
        let task = Task::completed(Box::new(42i32));
        assert!(task.is_done());
        assert_eq!(task.get_state(), State::Done);
        let value = task.take_value().unwrap().downcast::<i32>().unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_orphan_identity() {
        let task = Task::leaf(Box::new(|| Box::new(1i32) as BoxedValue));
        assert!(task.is_orphan());
        assert_eq!(task.id().family(), 0);
        assert_eq!(task.depth(), 0);
        assert!(!task.is_splittable());
        force_done(&task);
    }

    #[test]
    fn test_adoption_assigns_ids_and_keeps_existing_family() {
        let family = create_family();
        let other = create_family();
        let task = Task::completed(Box::new(()));

        task.adopt(&family, TaskPath::root().left());
        assert_eq!(task.id().family(), family.id());
        assert_eq!(task.path(), TaskPath::root().left());
        // adopted done tasks report their completion
        assert!(family.is_complete(TaskPath::root().left()));

        // a second adoption does not reassign
        task.adopt(&other, TaskPath::root());
        assert_eq!(task.id().family(), family.id());
    }

    #[test]
    fn test_adoption_propagates_to_children() {
        let family = create_family();
        let split = Task::composed(
            Task::completed(Box::new(())),
            Task::completed(Box::new(())),
            None,
            true,
        );
        split.adopt(&family, TaskPath::root());

        {
            let links = split.links.lock();
            let left = links.left.as_ref().unwrap();
            let right = links.right.as_ref().unwrap();
            assert_eq!(left.path(), TaskPath::root().left());
            assert_eq!(right.path(), TaskPath::root().right());
            assert_eq!(left.id().family(), family.id());
        }

        // children were already done, their paths are complete
        assert!(family.is_complete(TaskPath::root().left()));
        assert!(family.is_complete(TaskPath::root().right()));
        // the split task itself has not finished
        assert!(!family.is_complete(TaskPath::root()));

        // detach the children and retire the split task by hand, it never
        // runs in this test
        {
            let mut links = split.links.lock();
            links.left = None;
            links.right = None;
        }
        force_done(&split);
    }

    #[test]
    fn test_display_of_blocked_leaf() {
        let task = Task::leaf(Box::new(|| Box::new(()) as BoxedValue));
        assert_eq!(task.to_string(), "0.r : New");
        force_done(&task);
    }

    #[test]
    #[should_panic(expected = "last dependency before release")]
    fn test_losing_the_release_dependency_early_is_fatal() {
        let task = Task::leaf(Box::new(|| Box::new(()) as BoxedValue));
        // the synthetic release dependency may only be counted off by start
        task.dependency_done();
    }
}
