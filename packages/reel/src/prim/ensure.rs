use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::driver::{Env, TaskId};
use crate::{
    Chunk, Context, Forward, Job, Outcome, Resume, Routine, Step, Suspension, Target, Value,
    WorkerContext,
};

/// A unit of work for [`ensure_async`]
pub enum AsyncUnit {
    /// A routine, stepped by the driver (or on a worker, see [`Ensure::thread`])
    Routine(Box<dyn Routine>),
    /// A plain blocking callable. Always executed on the worker pool
    Callable(Job),
}

impl AsyncUnit {
    pub fn routine<R: Routine>(routine: R) -> Self {
        Self::Routine(Box::new(routine))
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
    {
        Self::Callable(Box::new(f))
    }
}

/// Options for [`ensure_async`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ensure {
    /// Step the routine's body on worker threads instead of the driver
    pub thread: bool,
    /// Forward the unit's chunks as they are produced. When false, they are
    /// dropped, and only the result is emitted
    pub partial: bool,
}

impl Default for Ensure {
    fn default() -> Self {
        Self {
            thread: false,
            partial: true,
        }
    }
}

impl Ensure {
    pub fn partial(partial: bool) -> Self {
        Self {
            partial,
            ..Default::default()
        }
    }

    pub fn on_thread(mut self, thread: bool) -> Self {
        self.thread = thread;
        self
    }
}

/// Run a unit of work without blocking the driver thread.
///
/// - Callables run on the worker pool.
/// - Routines are delegated to. With [`Ensure::thread`], every step of the
///   routine's body runs on a worker thread, so it may block. Chunks are
///   still forwarded live.
///
/// With [`Ensure::partial`], the unit's chunks are forwarded as they are
/// produced. Otherwise they are dropped, and a non-unit result is emitted as
/// one chunk when the unit finishes. Either way, the current routine resumes
/// with the result.
pub fn ensure_async(unit: AsyncUnit, options: Ensure) -> Suspension {
    Suspension::Delegate {
        target: Target::Routine(Box::new(Ensured::Start(unit, options))),
        forward: Forward::Live,
    }
}

enum Ensured {
    Start(AsyncUnit, Ensure),
    Waiting { emit_result: bool },
    Emitted(Value),
    Done,
}

impl Routine for Ensured {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        match std::mem::replace(self, Self::Done) {
            Self::Start(unit, options) => {
                *self = Self::Waiting {
                    emit_result: !options.partial,
                };
                match unit {
                    AsyncUnit::Callable(job) => Suspension::Offload(job).into(),
                    AsyncUnit::Routine(routine) => {
                        let forward = if options.partial {
                            Forward::Live
                        } else {
                            Forward::Discard
                        };
                        let routine: Box<dyn Routine> = if options.thread {
                            Box::new(OnThread::new(routine))
                        } else {
                            routine
                        };
                        Suspension::Delegate {
                            target: Target::Routine(routine),
                            forward,
                        }
                        .into()
                    }
                }
            }
            Self::Waiting { emit_result } => match input.into_value() {
                Ok(value) if emit_result && !value.is_unit() => {
                    *self = Self::Emitted(value.clone());
                    Step::emit(value)
                }
                Ok(value) => Step::Return(value),
                Err(e) => Step::Raise(e),
            },
            Self::Emitted(value) => Step::Return(value),
            Self::Done => Step::Return(Value::Unit),
        }
    }

    fn name(&self) -> &str {
        "ensure_async"
    }
}

/// Routine whose body is stepped on the worker pool.
///
/// Each offloaded job advances the body until it emits a chunk that should be
/// forwarded, or finishes. Suspensions inside the body are waited on by
/// blocking the worker.
struct OnThread {
    name: String,
    frames: Arc<Mutex<Frames>>,
}

struct Frames {
    stack: Vec<Frame>,
    /// Input for the next step
    input: Option<Resume>,
    /// What the last job stopped at
    stopped: Option<Stop>,
}

struct Frame {
    routine: Box<dyn Routine>,
    /// If chunks of this frame reach the output
    forward: bool,
}

enum Stop {
    Emit(Chunk),
    Finish(Outcome),
}

impl OnThread {
    fn new(routine: Box<dyn Routine>) -> Self {
        let name = format!("{} (on thread)", routine.name());
        Self {
            name,
            frames: Arc::new(Mutex::new(Frames {
                stack: vec![Frame {
                    routine,
                    forward: true,
                }],
                input: Some(Resume::Start),
                stopped: None,
            })),
        }
    }
}

impl Routine for OnThread {
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step {
        match input {
            // first step, or the last chunk was accepted
            Resume::Start | Resume::Continue => {
                let frames = Arc::clone(&self.frames);
                let env = cx.env().clone();
                let task = cx.task_id();
                Suspension::Offload(Box::new(move |wcx| {
                    let mut frames = frames.lock().unwrap_or_else(|e| e.into_inner());
                    let stop = frames.advance(&env, task, wcx);
                    frames.stopped = Some(stop);
                    Ok(Value::Unit)
                }))
                .into()
            }
            Resume::Value(_) => {
                let stopped = self
                    .frames
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .stopped
                    .take();
                match stopped {
                    Some(Stop::Emit(chunk)) => Step::Emit(chunk),
                    Some(Stop::Finish(Ok(value))) => Step::Return(value),
                    Some(Stop::Finish(Err(e))) => Step::Raise(e),
                    None => Step::raise(crate::fmterr!("worker finished without advancing '{}'", self.name)),
                }
            }
            Resume::Error(e) => Step::Raise(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Frames {
    fn advance(&mut self, env: &Env, task: TaskId, wcx: &WorkerContext) -> Stop {
        let mut input = self.input.take().unwrap_or(Resume::Continue);
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Stop::Finish(Ok(Value::Unit));
            };
            let forward = frame.forward;
            let step = {
                let mut cx = Context::new(task, env);
                let routine = &mut frame.routine;
                crate::misc::catch_panic("routine step", || routine.resume(&mut cx, input))
            };
            input = match step.unwrap_or_else(|e| Step::Raise(e.into())) {
                Step::Emit(chunk) => {
                    if forward {
                        self.input = Some(Resume::Continue);
                        return Stop::Emit(chunk);
                    }
                    Resume::Continue
                }
                Step::Suspend(Suspension::Sleep(duration)) => {
                    let start = Instant::now();
                    std::thread::sleep(duration);
                    Resume::Value(Value::Elapsed(start.elapsed()))
                }
                Step::Suspend(Suspension::Offload(job)) => {
                    // already on a worker
                    match crate::misc::catch_panic("worker job", || job(wcx)).and_then(|x| x) {
                        Ok(value) => Resume::Value(value),
                        Err(e) => Resume::Error(e.into()),
                    }
                }
                Step::Suspend(Suspension::Delegate { target, forward: child }) => match target {
                    Target::Cell(cell) => match cell.wait_blocking() {
                        Ok(value) => Resume::Value(value),
                        Err(e) => Resume::Error(e),
                    },
                    Target::Routine(routine) => {
                        self.stack.push(Frame {
                            routine,
                            forward: forward && child == Forward::Live,
                        });
                        Resume::Start
                    }
                },
                Step::Return(value) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        return Stop::Finish(Ok(value));
                    }
                    Resume::Value(value)
                }
                Step::Raise(e) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        return Stop::Finish(Err(e));
                    }
                    Resume::Error(e)
                }
            };
        }
    }
}
