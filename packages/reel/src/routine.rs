//! Routine declaration: what a step can produce, and how routines are built
//!
//! A routine is a resumable state object. Each call to [`Routine::resume`]
//! runs the body up to the next point where it has something to say to the
//! driver, and returns that as a [`Step`]. Local variables that must survive
//! a suspension live as fields of the routine.
//!
//! ```rust
//! # use pistonite_reel as reel;
//! use reel::{Context, Resume, Routine, Step, Value};
//! use std::time::Duration;
//!
//! /// Emits "tick", sleeps, emits "tock", returns the elapsed time
//! enum TickTock { Start, Ticked, Sleeping, Tocked(Value) }
//!
//! impl Routine for TickTock {
//!     fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
//!         match self {
//!             TickTock::Start => {
//!                 *self = TickTock::Ticked;
//!                 Step::emit("tick")
//!             }
//!             TickTock::Ticked => {
//!                 *self = TickTock::Sleeping;
//!                 reel::sleep(Duration::from_millis(10)).into()
//!             }
//!             TickTock::Sleeping => match input.into_value() {
//!                 Ok(elapsed) => {
//!                     *self = TickTock::Tocked(elapsed);
//!                     Step::emit("tock")
//!                 }
//!                 Err(e) => Step::Raise(e),
//!             },
//!             TickTock::Tocked(elapsed) => Step::Return(elapsed.clone()),
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::{Cell, Context, Driver, Failure, Job, Stream, Value};

/// What a routine is resumed with
#[derive(Debug, Clone)]
pub enum Resume {
    /// First step of the routine
    Start,
    /// The previous step emitted a chunk, and the routine should keep going
    Continue,
    /// The awaited suspension completed with a value
    Value(Value),
    /// The awaited suspension failed. The routine may handle it,
    /// or raise it again to propagate it to its own waiters
    Error(Failure),
}

impl Resume {
    /// Get the resumed value. `Start` and `Continue` are `Unit`.
    pub fn into_value(self) -> Result<Value, Failure> {
        match self {
            Self::Start | Self::Continue => Ok(Value::Unit),
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

/// One element of an output stream
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Marker to flush buffered header information before further chunks
    Header,
    /// Content
    Data(Value),
}

impl Chunk {
    /// Get the data, `None` for a header marker
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Header => None,
            Self::Data(v) => Some(v),
        }
    }

    /// Get the data, `None` for a header marker
    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Header => None,
            Self::Data(v) => Some(v),
        }
    }
}

/// What a step produced
pub enum Step {
    /// Forward a chunk to whoever consumes the task's output. This is not a
    /// suspension: the routine is resumed with [`Resume::Continue`] once the chunk
    /// is accepted
    Emit(Chunk),
    /// Pause until the awaited condition completes
    Suspend(Suspension),
    /// Finish with a value
    Return(Value),
    /// Finish with a failure
    Raise(Failure),
}

impl Step {
    /// Emit a data chunk
    pub fn emit(value: impl Into<Value>) -> Self {
        Self::Emit(Chunk::Data(value.into()))
    }

    /// Finish with a value
    pub fn ret(value: impl Into<Value>) -> Self {
        Self::Return(value.into())
    }

    /// Finish with an error
    pub fn raise(error: impl Into<Failure>) -> Self {
        Self::Raise(error.into())
    }
}

impl From<Suspension> for Step {
    fn from(value: Suspension) -> Self {
        Self::Suspend(value)
    }
}

impl From<Result<Suspension, crate::CoreError>> for Step {
    fn from(value: Result<Suspension, crate::CoreError>) -> Self {
        match value {
            Ok(s) => Self::Suspend(s),
            Err(e) => Self::Raise(e.into()),
        }
    }
}

/// What a suspended routine is waiting for
pub enum Suspension {
    /// Resume with the elapsed time (a [`Value::Elapsed`]) after the duration
    Sleep(Duration),
    /// Resume with the outcome of another routine or an existing cell
    Delegate {
        target: Target,
        forward: Forward,
    },
    /// Resume with the return value of a blocking callable, executed
    /// on the worker pool
    Offload(Job),
}

impl std::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sleep(d) => write!(f, "Sleep({d:?})"),
            Self::Delegate { target: Target::Routine(r), forward } => {
                write!(f, "Delegate({}, {forward:?})", r.name())
            }
            Self::Delegate { target: Target::Cell(c), .. } => write!(f, "Delegate(cell {})", c.id()),
            Self::Offload(_) => write!(f, "Offload"),
        }
    }
}

/// What a [`Suspension::Delegate`] waits on
pub enum Target {
    /// Start a new task for the routine and wait for it
    Routine(Box<dyn Routine>),
    /// Wait for a cell that already exists
    Cell(Cell),
}

/// What happens to chunks emitted by a delegated routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Forward to the delegating task's output as they are produced
    Live,
    /// Drop them. Only the return value reaches the delegating task
    Discard,
}

/// A generator-style routine driven step by step.
///
/// A routine is only ever stepped on the driver thread, one step at a time,
/// so its state needs no locking. A step should not block: use
/// [`Suspension::Offload`] for blocking work.
pub trait Routine: Send + 'static {
    /// Run until the next step
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step;

    /// Name of the routine in log messages
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<R: Routine + ?Sized> Routine for Box<R> {
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step {
        (**self).resume(cx, input)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Routine from a closure. See [`routine_fn`]
pub struct FnRoutine<F> {
    name: &'static str,
    f: F,
}

/// Make a routine from a closure that is called for every step
///
/// ```rust
/// # use pistonite_reel as reel;
/// use reel::Step;
/// let mut n = 0;
/// let counter = reel::routine_fn("counter", move |_, _| {
///     n += 1;
///     if n > 3 { Step::ret(n) } else { Step::emit(n) }
/// });
/// ```
pub fn routine_fn<F>(name: &'static str, f: F) -> FnRoutine<F>
where
    F: FnMut(&mut Context<'_>, Resume) -> Step + Send + 'static,
{
    FnRoutine { name, f }
}

impl<F> Routine for FnRoutine<F>
where
    F: FnMut(&mut Context<'_>, Resume) -> Step + Send + 'static,
{
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step {
        (self.f)(cx, input)
    }
    fn name(&self) -> &str {
        self.name
    }
}

/// Routine that emits literal chunks, then returns `Unit`
pub struct Chunks<I>(I);

/// Make a routine that emits every item of `iter` as a data chunk
pub fn chunks<I>(iter: I) -> Chunks<I::IntoIter>
where
    I: IntoIterator,
    I::Item: Into<Value>,
    I::IntoIter: Send + 'static,
{
    Chunks(iter.into_iter())
}

impl<I> Routine for Chunks<I>
where
    I: Iterator + Send + 'static,
    I::Item: Into<Value>,
{
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        if let Resume::Error(e) = input {
            return Step::Raise(e);
        }
        match self.0.next() {
            Some(x) => Step::emit(x),
            None => Step::Return(Value::Unit),
        }
    }
    fn name(&self) -> &str {
        "chunks"
    }
}

/// A routine factory: the declared form of a routine.
///
/// Invoking it does not run anything inline - it produces a task handle
/// (a [`Cell`] or a [`Stream`]) or a suspension to delegate to.
/// Created with [`coroutine`]. The factory can be cloned and shared between threads.
pub struct Coroutine<A> {
    name: &'static str,
    make: Arc<dyn Fn(A) -> Box<dyn Routine> + Send + Sync>,
}

impl<A> Clone for Coroutine<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            make: Arc::clone(&self.make),
        }
    }
}

/// Declare a routine. `f` builds the routine state from the call arguments.
///
/// ```rust,no_run
/// # use pistonite_reel as reel;
/// let greet = reel::coroutine("greet", |name: String| {
///     reel::chunks([format!("hello {name}\n")])
/// });
/// let stream = greet.stream(reel::Driver::global(), "world".to_string());
/// for chunk in stream {
///     println!("{:?}", chunk);
/// }
/// ```
pub fn coroutine<A, R, F>(name: &'static str, f: F) -> Coroutine<A>
where
    F: Fn(A) -> R + Send + Sync + 'static,
    R: Routine,
{
    Coroutine {
        name,
        make: Arc::new(move |args| Box::new(f(args))),
    }
}

impl<A> Coroutine<A> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Build the routine state without scheduling it
    pub fn instantiate(&self, args: A) -> Box<dyn Routine> {
        (self.make)(args)
    }

    /// Start a task. Chunks it emits are discarded, and the returned cell settles
    /// with its return value.
    pub fn call(&self, driver: &Driver, args: A) -> Cell {
        driver.spawn_boxed(self.instantiate(args))
    }

    /// Start a task as the source of an output stream
    pub fn stream(&self, driver: &Driver, args: A) -> Stream {
        driver.stream_boxed(self.instantiate(args))
    }

    /// Suspension that runs the routine as a child of the current task,
    /// forwarding its chunks live, and resumes with its return value
    pub fn delegate(&self, args: A) -> Suspension {
        Suspension::Delegate {
            target: Target::Routine(self.instantiate(args)),
            forward: Forward::Live,
        }
    }
}

impl<A> std::fmt::Debug for Coroutine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine").field("name", &self.name).finish()
    }
}
