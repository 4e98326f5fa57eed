//! # Coroutine Driver
//!
//! A single driver thread steps every task. Each step runs a routine until it
//! emits a chunk, suspends, returns, or raises (see [`Step`](crate::Step)).
//! No two steps ever run at the same time, so a routine's body executes
//! strictly sequentially, exactly as written.
//!
//! Work that happens while a task is suspended runs elsewhere:
//! - sleeps are waited on by the timer thread ([`TimerWheel`])
//! - blocking callables run on the worker threads ([`WorkerPool`])
//! - delegated routines are stepped by the driver as their own tasks
//!
//! Completion is always handed back to the driver thread as a message,
//! so cells can be settled from any thread.
//!
//! When a timer and a worker job complete at the same time, which task resumes
//! first depends on which message reaches the driver first. Timers that fire
//! at the same deadline resume in the order they were scheduled.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::stream::StreamEvent;
use crate::{
    Cell, Config, CoreError, ErrorContext as _, Outcome, Routine, Stream, TimerHandle, TimerWheel,
    Value, WorkerContext, WorkerPool,
};

mod trampoline;
use trampoline::Trampoline;

thread_local! {
    static ON_DRIVER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Check if the current thread is a driver thread
pub fn on_driver_thread() -> bool {
    ON_DRIVER.get()
}

pub(crate) type TaskId = usize;
pub(crate) type StreamId = usize;

/// Messages handled by the driver thread
pub(crate) enum Msg {
    /// Start a task
    Spawn(TaskSpawn),
    /// Start a task as the source of a stream
    Open {
        stream: StreamId,
        sink: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
        root: TaskSpawn,
    },
    /// A suspension of the task completed
    Wake { task: TaskId, outcome: Outcome },
    /// The consumer of the stream wants one more chunk
    Pull(StreamId),
    /// The consumer of the stream is gone
    Release(StreamId),
    Shutdown,
}

pub(crate) struct TaskSpawn {
    pub id: TaskId,
    pub routine: Box<dyn Routine>,
    pub cell: Cell,
}

/// Handles to everything a task can interact with, shared by the driver
/// thread and every [`Context`]
#[derive(Clone)]
pub(crate) struct Env {
    pub tx: Sender<Msg>,
    pub timer: TimerWheel,
    pub pool: WorkerPool,
    pub config: Arc<Config>,
}

impl Env {
    fn send(&self, msg: Msg) -> Result<(), CoreError> {
        self.tx.send(msg).map_err(|_| CoreError::DriverStopped)
    }

    fn task(routine: Box<dyn Routine>) -> TaskSpawn {
        TaskSpawn {
            id: crate::atomic::next_atomic_usize(),
            routine,
            cell: Cell::new(),
        }
    }

    pub fn spawn(&self, routine: Box<dyn Routine>) -> Cell {
        let task = Self::task(routine);
        let cell = task.cell.clone();
        crate::trace!("spawning task {} ({})", task.id, task.routine.name());
        if let Err(e) = self.send(Msg::Spawn(task)) {
            let _: Result<_, _> = cell.fail(e);
        }
        cell
    }

    pub fn open(&self, routine: Box<dyn Routine>) -> Stream {
        let root = Self::task(routine);
        let cell = root.cell.clone();
        let stream = crate::atomic::next_atomic_usize();
        let (sink, recv) = tokio::sync::mpsc::unbounded_channel();
        crate::trace!(
            "opening stream {stream} with task {} ({})",
            root.id,
            root.routine.name()
        );
        if let Err(e) = self.send(Msg::Open { stream, sink, root }) {
            let _: Result<_, _> = cell.fail(e);
        }
        Stream::new(stream, recv, self.tx.clone(), cell)
    }

    pub fn timer_cell(&self, duration: Duration) -> (TimerHandle, Cell) {
        let cell = Cell::new();
        let fired = cell.clone();
        let handle = self.timer.schedule(duration, move |elapsed| {
            fired.try_settle(Ok(Value::Elapsed(elapsed)));
        });
        (handle, cell)
    }
}

/// Explicit context handed to every step of a routine
pub struct Context<'a> {
    task: TaskId,
    env: &'a Env,
    timers: Vec<(TimerHandle, Cell)>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(task: TaskId, env: &'a Env) -> Self {
        Self {
            task,
            env,
            timers: Vec::new(),
        }
    }

    /// Timers created during this step
    pub(crate) fn take_timers(&mut self) -> Vec<(TimerHandle, Cell)> {
        std::mem::take(&mut self.timers)
    }

    pub(crate) fn env(&self) -> &'a Env {
        self.env
    }

    /// Id of the task being stepped
    pub fn task_id(&self) -> usize {
        self.task
    }

    /// Configuration of the driver
    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// Start an independent task. Its chunks are discarded and the returned
    /// cell settles with its return value.
    ///
    /// The task starts after the current step. Awaiting the cell with
    /// [`await_cell`](crate::await_cell) is how a routine joins it later.
    pub fn spawn<R: Routine>(&mut self, routine: R) -> Cell {
        self.env.spawn(Box::new(routine))
    }

    /// A cell that resolves with the elapsed time after `duration`.
    ///
    /// Unlike [`sleep`](crate::sleep), this doesn't suspend anything, so it
    /// can be raced against other work with [`Cell::first_of`].
    ///
    /// A timer that hasn't fired when the task finishes (or is abandoned)
    /// is cancelled, and its cell never settles.
    pub fn timer(&mut self, duration: Duration) -> Cell {
        let (handle, cell) = self.env.timer_cell(duration);
        self.timers.push((handle, cell.clone()));
        cell
    }

    /// Submit a blocking callable to the worker pool without suspending
    pub fn offload<F>(&mut self, f: F) -> Result<Cell, CoreError>
    where
        F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
    {
        self.env.pool.submit(f)
    }
}

/// Handle to a driver: the thread that steps tasks, plus the timer wheel
/// and worker pool it waits on.
///
/// The handle can be cloned and shared between threads. Use
/// [`Driver::global`] unless isolation is needed (for example, in tests).
///
/// The driver stops when the last handle is dropped. Streams it produced
/// count as handles. Cells don't: a task only spawned with
/// [`spawn`](Self::spawn) fails with [`CoreError::DriverStopped`] once every
/// handle is gone.
#[derive(Clone)]
pub struct Driver(Arc<Shared>);
struct Shared {
    env: Env,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// the process-wide driver
static GLOBAL: LazyLock<Driver> = LazyLock::new(|| {
    let config = Config::from_env().unwrap_or_else(|e| {
        crate::warn!("invalid driver configuration from environment, using defaults: {e:?}");
        Config::default()
    });
    Driver::new(config).expect("cannot create global driver")
});

impl Driver {
    /// Start a driver with its own threads
    pub fn new(config: Config) -> crate::Result<Self> {
        let prefix = config.thread_prefix.clone();
        let timer = TimerWheel::new(format!("{prefix}-timer"))?;
        let pool = WorkerPool::new(crate::worker_count(config.workers), &prefix)?;
        let (tx, rx) = mpsc::channel();
        let env = Env {
            tx,
            timer,
            pool,
            config: Arc::new(config),
        };
        let trampoline = Trampoline::new(env.clone(), rx);
        let thread = crate::check!(
            std::thread::Builder::new()
                .name(format!("{prefix}-driver"))
                .spawn(move || {
                    ON_DRIVER.set(true);
                    trampoline.run();
                }),
            "failed to spawn driver thread"
        )?;
        crate::debug!(
            "driver started with {} worker(s), prefetch {}",
            env.pool.workers(),
            env.config.prefetch
        );
        Ok(Self(Arc::new(Shared {
            env,
            thread: Mutex::new(Some(thread)),
        })))
    }

    /// Get the process-wide driver, configured with [`Config::from_env`]
    pub fn global() -> &'static Driver {
        &GLOBAL
    }

    pub fn config(&self) -> &Config {
        &self.0.env.config
    }

    pub fn timer(&self) -> &TimerWheel {
        &self.0.env.timer
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.0.env.pool
    }

    /// Start a task. Chunks it emits are discarded, and the returned cell
    /// settles with its return value.
    pub fn spawn<R: Routine>(&self, routine: R) -> Cell {
        self.spawn_boxed(Box::new(routine))
    }

    pub fn spawn_boxed(&self, routine: Box<dyn Routine>) -> Cell {
        self.0.env.spawn(routine)
    }

    /// Start a task as the source of an output stream
    pub fn stream<R: Routine>(&self, routine: R) -> Stream {
        self.stream_boxed(Box::new(routine))
    }

    /// The stream holds a handle to the driver, so the driver keeps running
    /// while the stream is alive
    pub fn stream_boxed(&self, routine: Box<dyn Routine>) -> Stream {
        self.0.env.open(routine).keep_alive(self.clone())
    }

    /// Make a stream out of a plain blocking callable. It runs on the
    /// worker pool, and its return value becomes the only chunk
    pub fn stream_blocking<F>(&self, f: F) -> Stream
    where
        F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
    {
        self.stream(crate::prim::offloaded(f))
    }

    /// A cell that resolves with the elapsed time after `duration`.
    ///
    /// The entry stays in the timer wheel until it fires. Inside a routine, use
    /// [`Context::timer`], which is cancelled together with the task.
    pub fn sleep(&self, duration: Duration) -> Cell {
        self.0.env.timer_cell(duration).1
    }

    /// Check if the driver thread is still running
    pub fn is_running(&self) -> bool {
        self.0
            .thread
            .lock()
            .map(|x| x.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the driver.
    ///
    /// Unfinished tasks fail with [`CoreError::DriverStopped`], timers stop
    /// firing, and the worker pool is drained (running callables are not interrupted).
    pub fn shutdown(&self) {
        let _: Result<_, _> = self.0.env.send(Msg::Shutdown);
        let thread = self.0.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread
            && !on_driver_thread()
        {
            let _: Result<_, _> = thread.join();
        }
        self.0.env.timer.shutdown();
        self.0.env.pool.shutdown();
        crate::debug!("driver stopped");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // the driver thread only holds the environment, not the handle,
        // so losing every handle stops it
        let _: Result<_, _> = self.env.send(Msg::Shutdown);
        self.env.timer.shutdown();
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("workers", &self.0.env.pool.workers())
            .field("timers", &self.0.env.timer.len())
            .field("running", &self.is_running())
            .finish()
    }
}
