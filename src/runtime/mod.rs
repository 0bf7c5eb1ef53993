//! The worker pool scheduler: per-worker queues, speculative splitting,
//! random victim stealing and cooperative waiting.

use crate::runtime::worker::Worker;
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

mod builder;
pub use builder::{Builder, NUM_WORKERS_ENV};
pub(crate) use builder::hardware_concurrency;

pub(crate) mod pool;
pub use pool::WorkerPool;

pub(crate) mod predictor;
pub(crate) use predictor::RuntimePredictor;

pub(crate) mod queue;

pub(crate) mod worker;


/// Depth below which top-level (family member) tasks are split eagerly at
/// release and placed deterministically across the pool. Tunable.
pub(crate) const TOP_LEVEL_CUTOFF_DEPTH: usize = 4;

static GLOBAL_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

/// The process-wide pool, created on first use from the environment
/// (`NUM_WORKERS`). It lives for the rest of the process; idle workers park
/// themselves and cost nothing.
pub fn global() -> &'static Arc<WorkerPool> {
    GLOBAL_POOL.get_or_init(|| Builder::from_env().build())
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Makes `worker` the scheduling context of the current thread.
pub(crate) fn bind_current_worker(worker: Arc<Worker>) {
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(worker));
}

/// The worker owning the current thread. Threads outside any pool fall back
/// to worker 0 of the global pool.
pub(crate) fn current_worker() -> Arc<Worker> {
    if let Some(worker) = CURRENT_WORKER.with(|current| current.borrow().clone()) {
        return worker;
    }
    global().worker(0)
}
