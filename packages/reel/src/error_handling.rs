use std::sync::Arc;

pub use anyhow::{Context as ErrorContext, Error, Ok, Result, anyhow as fmterr, bail};

/// # Error Handling
///
/// General errors are re-exported from [`anyhow`](https://docs.rs/anyhow):
/// - `anyhow::Result` is `reel::Result`
/// - `anyhow::bail!`  is `reel::bail!`
/// - `anyhow::anyhow` is `reel::fmterr`
///
/// Errors produced by the core itself are [`CoreError`]. Errors that travel
/// through a [`Cell`](crate::Cell) are wrapped in a [`Failure`], so the same
/// error can be handed to every subscriber.
///
/// `reel::check!` wraps `.with_context()`
/// ```rust
/// # use pistonite_reel as reel;
/// use reel::pre::*;
///
/// fn some_fallable_func() -> reel::Result<String> {
///     Ok("foo".to_string())
/// }
/// fn main() -> reel::Result<()> {
///     let input: i32 = 42;
///     let foo = reel::check!(some_fallable_func(), "failed: {input}")?;
///     assert_eq!(foo, "foo");
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! check {
    ($result:expr, $($args:tt)*) => {{
        { $result }.with_context(|| format!($($args)*))
    }};
}

/// Rethrow an `Err`, optionally with additional context
///
/// Prelude import is required to bring in the Context trait.
#[macro_export]
macro_rules! rethrow {
    ($result:expr) => {
        return Err($result);
    };
    ($result:expr, $($args:tt)*) => {{
        return Err($result).context(format!($($args)*));
    }};
}

/// Errors raised by the core machinery.
#[derive(Debug, Clone, PartialEq, derive_more::Display, derive_more::Error)]
pub enum CoreError {
    /// A [`Cell`](crate::Cell) was resolved or failed twice
    #[display("result cell is already settled")]
    AlreadySettled,
    /// Work was submitted after the worker pool was shut down
    #[display("worker pool is closed")]
    PoolClosed,
    /// A duration that cannot be scheduled (NaN or infinite)
    #[display("invalid duration: {_0} seconds")]
    InvalidDuration(#[error(not(source))] f64),
    /// The consumer went away before the task finished
    #[display("task was abandoned before completion")]
    Abandoned,
    /// The driver thread is not running
    #[display("driver is not running")]
    DriverStopped,
    /// Blocking wait attempted on the driver thread
    #[display("cannot block on a result cell from the driver thread")]
    WouldDeadlock,
}

/// A failure delivered through a [`Cell`](crate::Cell) or a [`Stream`](crate::Stream).
///
/// Cheap to clone. Converts back into [`anyhow::Error`] with `?`.
#[derive(Clone)]
pub struct Failure(Arc<Error>);

impl Failure {
    pub fn new(error: impl Into<Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Make a failure from a message
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(Error::msg(message))
    }

    /// The underlying error
    pub fn error(&self) -> &Error {
        &self.0
    }

    /// Get the [`CoreError`], if this failure is one
    pub fn core(&self) -> Option<&CoreError> {
        match self.0.downcast_ref::<CoreError>() {
            Some(e) => Some(e),
            None => self.0.downcast_ref::<Failure>().and_then(Failure::core),
        }
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref()
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Error> for Failure {
    fn from(value: Error) -> Self {
        // a failure that went through `?` comes back unwrapped
        match value.downcast::<Failure>() {
            std::result::Result::Ok(failure) => failure,
            Err(value) => Self(Arc::new(value)),
        }
    }
}

impl From<CoreError> for Failure {
    fn from(value: CoreError) -> Self {
        Self::new(value)
    }
}
