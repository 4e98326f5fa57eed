//! Worker pool for blocking callables

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::runtime::{Builder, Runtime};

use crate::atomic::Atomic;
use crate::{Cell, CoreError, ErrorContext as _, Failure, Value};

thread_local! {
    static ON_WORKER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Resolve a worker count.
///
/// - If `capacity > 0`, then that is literally the number of workers.
/// - If `capacity = 0`, then it's the number of logical processors on the system
///   using the `num_cpus` crate, minimum 1.
/// - if `capacity < 0`, then it's the number of logical processors on the system,
///   minus the specified amount, and minimum 1.
#[inline(always)]
pub fn worker_count(capacity: isize) -> usize {
    match capacity {
        1.. => capacity as usize,
        c => {
            let n = num_cpus::get();
            n.saturating_sub(c.unsigned_abs()).max(1)
        }
    }
}

/// Explicit context handed to a callable running on the pool
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Id of the job being executed
    pub job: usize,
    /// Name of the worker thread executing the job
    pub worker: String,
}

/// A blocking callable submitted to the pool
pub type Job = Box<dyn FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PoolState {
    Open,
    Closed,
}
impl From<u8> for PoolState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Open,
            _ => Self::Closed,
        }
    }
}
impl From<PoolState> for u8 {
    fn from(value: PoolState) -> Self {
        value as Self
    }
}

/// A bounded set of threads that execute blocking callables.
///
/// Jobs are run on the blocking threads of a dedicated `tokio` runtime,
/// which is limited to the configured number of workers. When all workers
/// are busy, jobs queue without limit: there is no backpressure.
///
/// The pool can be cloned and shared between threads. Submission
/// returns a [`Cell`] that settles with the callable's return value, or with
/// the error it returned (or the panic it raised).
#[derive(Clone)]
pub struct WorkerPool(Arc<PoolInner>);
struct PoolInner {
    runtime: Mutex<Option<Runtime>>,
    workers: usize,
    state: Atomic<u8, PoolState>,
    /// Jobs submitted but not yet delivered
    in_flight: Mutex<usize>,
    drained: Condvar,
    /// Jobs currently executing
    busy: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with `workers` threads (at least 1)
    pub fn new(workers: usize, thread_prefix: &str) -> crate::Result<Self> {
        let workers = workers.max(1);
        let runtime = crate::check!(
            Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(workers)
                .thread_name(format!("{thread_prefix}-worker"))
                .build(),
            "cannot create worker pool runtime with {workers} worker(s)"
        )?;
        crate::debug!("worker pool started with {workers} worker(s)");
        Ok(Self(Arc::new(PoolInner {
            runtime: Mutex::new(Some(runtime)),
            workers,
            state: Atomic::new_u8(PoolState::Open as u8),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            busy: AtomicUsize::new(0),
        })))
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.0.workers
    }

    /// Number of jobs that are queued or running
    pub fn in_flight(&self) -> usize {
        *self.0.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check if the pool was shut down
    pub fn is_closed(&self) -> bool {
        self.0.state.get() == PoolState::Closed
    }

    /// Submit a callable to run on a worker thread.
    ///
    /// The only synchronous error is [`CoreError::PoolClosed`], when the pool
    /// has been shut down. Errors from the callable are delivered through the cell.
    pub fn submit<F>(&self, f: F) -> Result<Cell, CoreError>
    where
        F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
    {
        self.submit_job(Box::new(f))
    }

    /// Submit an already boxed [`Job`]
    pub fn submit_job(&self, job: Job) -> Result<Cell, CoreError> {
        let guard = self.0.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let Some(runtime) = guard.as_ref() else {
            return Err(CoreError::PoolClosed);
        };
        if self.is_closed() {
            return Err(CoreError::PoolClosed);
        }
        *self.0.in_flight.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let cell = Cell::new();
        let id = crate::atomic::next_atomic_usize();
        crate::trace!("submitting job {id} to worker pool");
        let inner = Arc::clone(&self.0);
        let result_cell = cell.clone();
        runtime.spawn_blocking(move || {
            ON_WORKER.set(true);
            let worker = std::thread::current()
                .name()
                .unwrap_or("worker")
                .to_string();
            let cx = WorkerContext { job: id, worker };
            inner.busy.fetch_add(1, Ordering::SeqCst);
            let result = crate::misc::catch_panic("worker job", || job(&cx)).and_then(|x| x);
            inner.busy.fetch_sub(1, Ordering::SeqCst);
            let outcome = result.map_err(Failure::from);
            if let Err(e) = &outcome {
                crate::debug!("job {id} on '{}' failed: {e}", cx.worker);
            }
            let _: Result<_, _> = result_cell.settle(outcome);
            inner.finish_one();
        });
        Ok(cell)
    }

    /// Number of jobs currently executing on a worker
    pub fn busy(&self) -> usize {
        self.0.busy.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, and wait for queued and running jobs to be delivered.
    ///
    /// Running callables are never interrupted. Calling this from inside a job
    /// would wait for itself, so it only closes the pool in that case.
    pub fn shutdown(&self) {
        {
            // submission checks the state under the same lock, so nothing
            // can sneak in after the drain below has started
            let _guard = self.0.runtime.lock().unwrap_or_else(|e| e.into_inner());
            if self.0.state.swap(PoolState::Closed) == PoolState::Closed {
                return;
            }
        }
        crate::debug!("worker pool shutting down, draining {} job(s)", self.in_flight());
        if ON_WORKER.get() {
            crate::warn!("worker pool shutdown requested from a worker, not draining");
            return;
        }
        let mut in_flight = self.0.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while *in_flight > 0 {
            in_flight = self
                .0
                .drained
                .wait(in_flight)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(in_flight);
        let runtime = self.0.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        crate::debug!("worker pool stopped");
    }
}

impl PoolInner {
    fn finish_one(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // dropping a runtime waits for blocking threads, which is
        // not allowed from within the runtime itself
        if let Some(runtime) = self.runtime.get_mut().ok().and_then(Option::take) {
            runtime.shutdown_background();
        }
    }
}
