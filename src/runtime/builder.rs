use crate::profiling::EventSink;
use crate::runtime::pool::{Shared, WorkerPool};
use crate::runtime::worker::{worker_main, Worker};
use crate::runtime;
use crate::utils::thread::pin_to_core;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Environment variable overriding the worker count of the global pool.
pub const NUM_WORKERS_ENV: &str = "NUM_WORKERS";

const DEFAULT_THREAD_NAME: &str = "treeture-worker";

/// Configures and creates a [`WorkerPool`].
///
/// The thread calling [`build`](Builder::build) becomes worker 0 of the new
/// pool: it gets no dedicated loop and participates through its `wait`
/// calls.
pub struct Builder {
    worker_threads: Option<usize>,

    /// Prefix for worker thread names, suffixed with the worker id.
    thread_name: String,

    event_sink: Option<Arc<dyn EventSink>>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            worker_threads: None,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            event_sink: None,
        }
    }

    /// Reads the pool size from `NUM_WORKERS`. Unset or unparseable values
    /// fall back to the hardware concurrency.
    pub fn from_env() -> Self {
        let mut builder = Builder::new();
        if let Ok(raw) = std::env::var(NUM_WORKERS_ENV) {
            match raw.parse::<usize>() {
                Ok(n) if n >= 1 => {
                    builder.worker_threads = Some(n);
                }
                _ => {
                    warn!(value = %raw, "ignoring unparseable {}", NUM_WORKERS_ENV);
                }
            }
        }
        builder
    }

    /// Sets the number of workers. Defaults to the hardware concurrency.
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker count cannot be zero");
        self.worker_threads = Some(n);
        self
    }

    /// Sets the prefix of the worker thread names. The default yields
    /// "treeture-worker-{id}".
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Installs a profiling sink receiving scheduler events.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Creates the pool, panicking when worker threads cannot be spawned.
    pub fn build(self) -> Arc<WorkerPool> {
        self.try_build().expect("failed to build worker pool")
    }

    /// Creates the pool.
    pub fn try_build(self) -> Result<Arc<WorkerPool>> {
        let num_workers = self
            .worker_threads
            .unwrap_or_else(hardware_concurrency)
            .max(1);

        let shared = Arc::new(Shared::new(self.event_sink));
        let workers: Vec<Arc<Worker>> = (0..num_workers)
            .map(|id| Arc::new(Worker::new(id, shared.clone())))
            .collect();
        shared.install_workers(workers.clone());

        // workers 1..n get dedicated threads, worker 0 is the calling thread
        let mut handles = Vec::with_capacity(num_workers.saturating_sub(1));
        for worker in workers.iter().skip(1) {
            let worker = worker.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.thread_name, worker.id()))
                .spawn(move || worker_main(worker))
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }

        runtime::bind_current_worker(workers[0].clone());
        pin_to_core(0);

        Ok(Arc::new(WorkerPool::from_parts(shared, handles)))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

pub(crate) fn hardware_concurrency() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}
