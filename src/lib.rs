//! A recursive, work-stealing task runtime for divide-and-conquer
//! parallelism.
//!
//! Computations are expressed as *treetures*: handles onto tasks that may,
//! at runtime, elect to split themselves into two child subtasks organized
//! as a binary tree. The runtime executes these trees across a fixed pool of
//! workers with per-worker queues, randomized work stealing, speculative
//! splitting driven by measured runtimes, and a dependency system that lets
//! later tasks wait on arbitrary subpaths within a task's splitting tree.
//!
//! ```no_run
//! use treeture::{after, combine, done, spawn};
//!
//! let six = spawn::<true, _, _>(after(), || 2 * 3).get();
//! assert_eq!(six, 6);
//!
//! let seven = combine(after(), done(3), done(4), |a: i32, b: i32| a + b, true).get();
//! assert_eq!(seven, 7);
//! ```

mod dependency;

mod family;
pub use family::TaskId;

mod ops;
pub use ops::{after, combine, done, parallel, sequential, spawn, spawn_splittable};

mod path;
pub use path::TaskPath;

pub mod profiling;

pub mod runtime;
pub use runtime::{Builder, WorkerPool};

mod task;
pub use task::State;

mod treeture;
pub use treeture::{Dependencies, TaskReference, Treeture, UnreleasedTreeture};

mod utils;
