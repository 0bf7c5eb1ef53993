use crate::profiling::Event;
use crate::runtime::pool::Shared;
use crate::runtime::queue::WorkQueue;
use crate::runtime::{self, RuntimePredictor};
use crate::task::Task;
use crate::utils::thread::pin_to_core;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Targeted maximum queue length. More a guideline than a limit, it may be
/// exceeded under high demand; beyond it, leaf tasks are executed inline on
/// the producing thread instead of queued.
pub(crate) const MAX_QUEUE_LENGTH: usize = 8;

/// Failed schedule attempts before a worker parks itself on the pool's
/// condition variable.
const IDLE_SPIN_BUDGET: u32 = 100_000;

/// Predicted runtime above which a splittable task is decomposed before it
/// runs. Stands in for the original tuning of roughly three million cycles.
const SPLIT_TIME_THRESHOLD: Duration = Duration::from_millis(3);

/// One member of the pool: a local deque of ready tasks, runtime statistics
/// to drive speculative splitting, and the stealing loop.
pub(crate) struct Worker {
    id: usize,

    shared: Arc<Shared>,

    alive: AtomicBool,

    /// Owner pops the front, thieves pop the back.
    queue: WorkQueue,

    /// Observed per-depth leaf runtimes of work executed by this worker.
    predictor: RuntimePredictor,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        Worker {
            id,
            shared,
            alive: AtomicBool::new(true),
            queue: WorkQueue::new(),
            predictor: RuntimePredictor::new(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn queue_snapshot(&self) -> Vec<Arc<Task>> {
        self.queue.snapshot()
    }

    /// Hands a ready task to this worker. On a singleton pool, or when the
    /// queue has grown past its target length, leaf tasks run inline on the
    /// calling thread instead (split tasks must not, their children would
    /// deadlock behind them).
    pub(crate) fn schedule(&self, task: Arc<Task>) {
        assert!(task.is_ready(), "scheduled task is not ready");

        if self.shared.num_workers() == 1
            || (self.queue.len() > MAX_QUEUE_LENGTH && !task.is_split())
        {
            self.run_task(&task);
            return;
        }

        self.queue.push_back(task);
        trace!(worker = self.id, len = self.queue.len(), "task enqueued");

        if self.queue.len() > MAX_QUEUE_LENGTH / 2 {
            self.shared.notify_work_available();
        }
    }

    /// One fetch-execute attempt: pop locally, otherwise steal from a random
    /// victim. Returns whether a task was run.
    pub(crate) fn schedule_step(&self) -> bool {
        loop {
            if let Some(task) = self.queue.pop_front() {
                assert!(task.is_ready());

                // queue is running dry, generate more work
                if self.queue.len() < MAX_QUEUE_LENGTH * 3 / 4 {
                    self.split_task(&task);
                }

                self.run_task(&task);
                return true;
            }

            let num_workers = self.shared.num_workers();
            if num_workers <= 1 {
                return false;
            }

            let victim = self.shared.worker(fastrand::usize(..num_workers));
            if victim.id == self.id {
                // picked ourselves, retry the whole step
                continue;
            }

            if let Some(task) = victim.queue.pop_back() {
                trace!(worker = self.id, victim = victim.id, task = %task.id(), "stole task");
                self.shared.emit(Event::TaskStolen(task.id()));

                // a stolen task signals starvation, split to spread the work
                self.split_task(&task);
                self.run_task(&task);
                return true;
            }

            std::hint::spin_loop();
            return false;
        }
    }

    /// Decomposes the task if it is splittable and predicted to be worth it.
    /// Top-level tasks split unconditionally.
    fn split_task(&self, task: &Arc<Task>) {
        if !task.is_splittable() {
            return;
        }
        let depth = task.depth();
        if depth == 0 || self.predictor.predict_time(depth) > SPLIT_TIME_THRESHOLD {
            task.split();
        }
    }

    /// Executes a task, sampling leaf runtimes into the predictor.
    pub(crate) fn run_task(&self, task: &Arc<Task>) {
        // splitting may leave behind an already-completed substitute
        if task.is_done() {
            return;
        }

        if task.is_split() {
            task.run();
            return;
        }

        self.shared.emit(Event::TaskStarted(task.id()));

        let depth = task.depth();
        if depth == 0 {
            // depth zero covers orphans and family roots, no prediction value
            task.run();
        } else {
            let started = Instant::now();
            task.run();
            self.predictor.register_time(depth, started.elapsed());
        }

        self.shared.emit(Event::TaskEnded(task.id()));
    }

    /// Parks this worker until new work is signalled. The pool's shutdown
    /// sequence poisons workers under the same lock, so the liveness check
    /// cannot miss the final wakeup.
    fn wait_for_work(&self) {
        let mut guard = self.shared.idle_lock().lock();
        if !self.is_alive() {
            return;
        }
        self.shared.work_available().wait(&mut guard);
    }
}

/// Thread body of every worker except worker 0, which is bound to the thread
/// that built the pool and only progresses through `wait` calls.
pub(crate) fn worker_main(worker: Arc<Worker>) {
    runtime::bind_current_worker(worker.clone());
    pin_to_core(worker.id());

    worker.shared.emit(Event::WorkerCreated {
        worker: worker.id(),
    });
    debug!(worker = worker.id(), "worker started");

    while worker.is_alive() {
        let mut idle_cycles = 0u32;

        while worker.is_alive() && !worker.schedule_step() {
            idle_cycles += 1;
            std::hint::spin_loop();

            if idle_cycles > IDLE_SPIN_BUDGET {
                worker.shared.emit(Event::WorkerSuspended {
                    worker: worker.id(),
                });
                debug!(worker = worker.id(), "worker suspended");

                worker.wait_for_work();

                worker.shared.emit(Event::WorkerResumed {
                    worker: worker.id(),
                });
                debug!(worker = worker.id(), "worker resumed");

                idle_cycles = 0;
            }
        }
    }

    worker.shared.emit(Event::WorkerDestroyed {
        worker: worker.id(),
    });
    debug!(worker = worker.id(), "worker stopped");
}
