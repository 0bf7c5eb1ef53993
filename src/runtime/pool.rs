use crate::profiling::{Event, EventSink};
use crate::runtime::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tracing::debug;

/// State shared between all workers of one pool. Workers hold it directly,
/// so a pool handle going away cannot invalidate a running worker.
pub(crate) struct Shared {
    /// All workers, indexable by id. Set exactly once during pool
    /// construction, read-only afterwards.
    workers: OnceLock<Vec<Arc<Worker>>>,

    /// A single mutex/condvar pair serves the whole pool: producers that
    /// fill a queue past half capacity wake everybody.
    idle_lock: Mutex<()>,
    work_available: Condvar,

    sink: Option<Arc<dyn EventSink>>,
}

impl Shared {
    pub(crate) fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Shared {
            workers: OnceLock::new(),
            idle_lock: Mutex::new(()),
            work_available: Condvar::new(),
            sink,
        }
    }

    pub(crate) fn install_workers(&self, workers: Vec<Arc<Worker>>) {
        if self.workers.set(workers).is_err() {
            unreachable!("pool workers installed twice");
        }
    }

    pub(crate) fn workers(&self) -> &[Arc<Worker>] {
        self.workers.get().expect("pool not initialized")
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers().len()
    }

    pub(crate) fn worker(&self, id: usize) -> &Arc<Worker> {
        &self.workers()[id]
    }

    pub(crate) fn notify_work_available(&self) {
        self.work_available.notify_all();
    }

    pub(crate) fn idle_lock(&self) -> &Mutex<()> {
        &self.idle_lock
    }

    pub(crate) fn work_available(&self) -> &Condvar {
        &self.work_available
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(sink) = &self.sink {
            sink.record(event);
        }
    }
}

/// A fixed-size pool of workers executing task trees.
///
/// Worker 0 is bound to the thread that built the pool and has no dedicated
/// loop; it makes progress whenever that thread waits on a treeture. All
/// other workers run stealing loops on their own threads until the pool is
/// shut down.
///
/// Most programs use the process-wide pool behind [`crate::runtime::global`];
/// independent pools exist for embedders and test harnesses.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn from_parts(shared: Arc<Shared>, handles: Vec<JoinHandle<()>>) -> Self {
        WorkerPool {
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn worker(&self, id: usize) -> Arc<Worker> {
        self.shared.worker(id).clone()
    }

    /// Stops all workers and joins their threads. Idempotent; also invoked
    /// by `Drop`.
    pub fn shutdown(&self) {
        {
            // Poisoning and the final wakeup happen under the idle lock so a
            // worker checking its liveness cannot slip into the condvar wait
            // between the two.
            let _guard = self.shared.idle_lock().lock();
            for worker in self.shared.workers() {
                worker.poison();
            }
            self.shared.notify_work_available();
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        debug!(threads = handles.len(), "joining worker threads");
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Renders every worker's queue content, for debugging hung schedules.
    pub fn dump_state<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for worker in self.shared.workers() {
            writeln!(out, "Worker {}:", worker.id())?;
            writeln!(out, "\tQueue:")?;
            for task in worker.queue_snapshot() {
                writeln!(out, "\t\t{}", task)?;
            }
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers())
            .finish()
    }
}
