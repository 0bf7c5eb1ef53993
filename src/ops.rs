//! Factory operators building (trees of) unreleased treetures.

use crate::family::create_family;
use crate::path::TaskPath;
use crate::task::{BoxedValue, MergeFn, Task};
use crate::treeture::{Dependencies, UnreleasedTreeture};
use std::sync::Arc;

/// An empty dependency set. Chain references onto it with
/// [`Dependencies::and`].
pub fn after() -> Dependencies {
    Dependencies::default()
}

/// A treeture that is already completed with `value`.
pub fn done<T: Send + 'static>(value: T) -> UnreleasedTreeture<T> {
    UnreleasedTreeture::of(Task::completed(Box::new(value)))
}

fn init<const ROOT: bool, T: Send + 'static>(
    deps: Dependencies,
    task: Arc<Task>,
) -> UnreleasedTreeture<T> {
    task.add_dependencies(&deps);
    if ROOT {
        task.adopt(&create_family(), TaskPath::root());
    }
    UnreleasedTreeture::of(task)
}

/// Creates a leaf task computing `body()` once `deps` are met.
///
/// With `ROOT = true` the task is adopted into a fresh family, making it
/// addressable through task references; `ROOT = false` produces an orphan
/// meant to be composed into a bigger tree.
pub fn spawn<const ROOT: bool, F, T>(deps: Dependencies, body: F) -> UnreleasedTreeture<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let task = Task::leaf(Box::new(move || Box::new(body()) as BoxedValue));
    init::<ROOT, T>(deps, task)
}

/// Creates a leaf task that the scheduler may decompose before execution.
///
/// `body` is the direct computation; `split` produces an equivalent tree of
/// subtasks and is invoked at the runtime's discretion (eagerly near the
/// top of a family, lazily when the task's predicted runtime warrants it).
pub fn spawn_splittable<const ROOT: bool, F, S, T>(
    deps: Dependencies,
    body: F,
    split: S,
) -> UnreleasedTreeture<T>
where
    F: FnOnce() -> T + Send + 'static,
    S: FnOnce() -> UnreleasedTreeture<T> + Send + 'static,
    T: Send + 'static,
{
    let task = Task::splittable(
        Box::new(move || Box::new(body()) as BoxedValue),
        Box::new(move || split().into_task()),
    );
    init::<ROOT, T>(deps, task)
}

/// Runs `a` to completion, then `b`. The resulting treeture completes once
/// both are done.
pub fn sequential<A, B>(
    deps: Dependencies,
    a: UnreleasedTreeture<A>,
    b: UnreleasedTreeture<B>,
) -> UnreleasedTreeture<()>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let task = Task::composed(a.into_task(), b.into_task(), None, false);
    init::<false, ()>(deps, task)
}

/// Runs `a` and `b` concurrently. The resulting treeture completes once both
/// are done.
pub fn parallel<A, B>(
    deps: Dependencies,
    a: UnreleasedTreeture<A>,
    b: UnreleasedTreeture<B>,
) -> UnreleasedTreeture<()>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let task = Task::composed(a.into_task(), b.into_task(), None, true);
    init::<false, ()>(deps, task)
}

/// Aggregates the values of `a` and `b` with `merge`. The children run
/// concurrently unless `run_parallel` is false.
pub fn combine<A, B, R, M>(
    deps: Dependencies,
    a: UnreleasedTreeture<A>,
    b: UnreleasedTreeture<B>,
    merge: M,
    run_parallel: bool,
) -> UnreleasedTreeture<R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    M: FnOnce(A, B) -> R + Send + 'static,
{
    let merge: MergeFn = Box::new(move |left, right| {
        let left = left
            .downcast::<A>()
            .expect("left child produced a value of an unexpected type");
        let right = right
            .downcast::<B>()
            .expect("right child produced a value of an unexpected type");
        Box::new(merge(*left, *right))
    });
    let task = Task::composed(a.into_task(), b.into_task(), Some(merge), run_parallel);
    init::<false, R>(deps, task)
}

/// N-ary form of [`sequential`]: runs the given treetures one after another,
/// left to right.
#[macro_export]
macro_rules! sequential {
    ($deps:expr, $a:expr $(,)?) => {
        $crate::sequential($deps, $a, $crate::done(()))
    };
    ($deps:expr, $a:expr, $b:expr $(,)?) => {
        $crate::sequential($deps, $a, $b)
    };
    ($deps:expr, $a:expr $(, $rest:expr)+ $(,)?) => {
        $crate::sequential($deps, $a, $crate::sequential!($crate::after() $(, $rest)+))
    };
}

/// N-ary form of [`parallel`]: runs the given treetures concurrently.
#[macro_export]
macro_rules! parallel {
    ($deps:expr, $a:expr $(,)?) => {
        $crate::parallel($deps, $a, $crate::done(()))
    };
    ($deps:expr, $a:expr, $b:expr $(,)?) => {
        $crate::parallel($deps, $a, $b)
    };
    ($deps:expr, $a:expr $(, $rest:expr)+ $(,)?) => {
        $crate::parallel($deps, $a, $crate::parallel!($crate::after() $(, $rest)+))
    };
}
