//! # Suspension Primitives
//!
//! Constructors for the steps a routine hands to the driver. They don't do
//! any work on their own: a routine returns them from [`Routine::resume`],
//! and the driver performs the suspension.
//!
//! ```rust
//! # use pistonite_reel as reel;
//! use reel::{Context, Resume, Routine, Step};
//!
//! struct Greet(u8);
//! impl Routine for Greet {
//!     fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
//!         self.0 += 1;
//!         match self.0 {
//!             1 => reel::emit_header(),
//!             2 => Step::emit("before\n"),
//!             3 => reel::delegate(reel::chunks(["hello\n"])).into(),
//!             4 => Step::emit("after\n"),
//!             _ => match input.into_value() {
//!                 Ok(_) => Step::ret(()),
//!                 Err(e) => Step::Raise(e),
//!             },
//!         }
//!     }
//! }
//! ```

use std::time::Duration;

use crate::{Cell, Chunk, CoreError, Forward, Routine, Step, Suspension, Target, Value, WorkerContext};

mod ensure;
pub use ensure::*;
#[cfg(feature = "net")]
mod net;
#[cfg(feature = "net")]
pub use net::*;

/// Suspend for `duration`. The routine resumes with the elapsed time
/// ([`Value::Elapsed`]), which is never less than `duration`
#[inline(always)]
pub fn sleep(duration: Duration) -> Suspension {
    Suspension::Sleep(duration)
}

/// Suspend for a number of seconds.
///
/// Negative durations are treated as zero: the routine resumes as soon as
/// possible. NaN and infinite durations are rejected.
pub fn sleep_secs(seconds: f64) -> Result<Suspension, CoreError> {
    Ok(Suspension::Sleep(secs_to_duration(seconds)?))
}

/// Convert seconds to a [`Duration`] the way [`sleep_secs`] does: negative
/// is zero, NaN and infinite are [`CoreError::InvalidDuration`]
pub fn secs_to_duration(seconds: f64) -> Result<Duration, CoreError> {
    if !seconds.is_finite() {
        return Err(CoreError::InvalidDuration(seconds));
    }
    if seconds < 0.0 {
        crate::debug!("negative duration {seconds}s treated as zero");
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| CoreError::InvalidDuration(seconds))
}

/// Run `routine` as a child task, forwarding its chunks live. The current
/// routine resumes with the child's return value, or its failure
pub fn delegate<R: Routine>(routine: R) -> Suspension {
    Suspension::Delegate {
        target: Target::Routine(Box::new(routine)),
        forward: Forward::Live,
    }
}

/// Run `routine` as a child task, dropping its chunks. Only the return
/// value reaches the current routine
pub fn delegate_quiet<R: Routine>(routine: R) -> Suspension {
    Suspension::Delegate {
        target: Target::Routine(Box::new(routine)),
        forward: Forward::Discard,
    }
}

/// Suspend until an existing cell settles
pub fn await_cell(cell: Cell) -> Suspension {
    Suspension::Delegate {
        target: Target::Cell(cell),
        forward: Forward::Discard,
    }
}

/// Run a blocking callable on the worker pool, resuming with its return value
pub fn run_on_thread<F>(f: F) -> Suspension
where
    F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
{
    Suspension::Offload(Box::new(f))
}

/// Marker telling the consumer to flush buffered header information
/// before the chunks that follow. This is not a suspension: the routine is
/// resumed right away
#[inline(always)]
pub fn emit_header() -> Step {
    Step::Emit(Chunk::Header)
}

/// Routine that runs one blocking callable on the worker pool, and
/// returns its value
pub(crate) struct Offloaded(Option<crate::Job>);

pub(crate) fn offloaded<F>(f: F) -> Offloaded
where
    F: FnOnce(&WorkerContext) -> crate::Result<Value> + Send + 'static,
{
    Offloaded(Some(Box::new(f)))
}

impl Routine for Offloaded {
    fn resume(&mut self, _: &mut crate::Context<'_>, input: crate::Resume) -> Step {
        if let Some(job) = self.0.take() {
            return Suspension::Offload(job).into();
        }
        match input.into_value() {
            Ok(value) => Step::Return(value),
            Err(e) => Step::Raise(e),
        }
    }
    fn name(&self) -> &str {
        "offloaded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_seconds_are_zero() {
        assert_eq!(secs_to_duration(-2.5).unwrap(), Duration::ZERO);
        assert_eq!(secs_to_duration(0.0).unwrap(), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5).unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn non_finite_seconds_are_rejected() {
        assert!(matches!(
            secs_to_duration(f64::NAN),
            Err(CoreError::InvalidDuration(x)) if x.is_nan()
        ));
        assert_eq!(
            secs_to_duration(f64::INFINITY).unwrap_err(),
            CoreError::InvalidDuration(f64::INFINITY)
        );
        let step: Step = sleep_secs(f64::NEG_INFINITY).into();
        assert!(matches!(step, Step::Raise(_)));
    }

    #[test]
    fn header_is_an_emit() {
        assert!(matches!(emit_header(), Step::Emit(Chunk::Header)));
    }
}
