//! Generator-style coroutines that stream response bodies
//!
//! # General Principle
//! A request handler is written as a [`Routine`]: a resumable state object
//! that reads top to bottom like sequential code. At every point where it
//! would wait (a sleep, a blocking call, another routine), it hands a
//! [`Suspension`] to the [`Driver`] and is resumed with the result later.
//! Between those points, it can emit chunks of the response body, which reach
//! the serving loop through a pull-based [`Stream`].
//!
//! Common utilities are exported directly by the crate and should be used
//! as `reel::xxx`. The prelude module `pre` brings the `anyhow` context
//! trait into scope, which is needed by [`check!`]:
//! ```rust
//! # use pistonite_reel as reel;
//! use reel::pre::*;
//! ```
//!
//! Quick Feature Reference:
//! - `net`: Enables [`network_request`] using `reqwest`
//! - `toml`: Enables loading [`Config`] from TOML
//!
//! # Components
//! - [`Cell`]: single-assignment result container that tasks wait on
//! - [`TimerWheel`]: schedules wake-ups after a delay on a timer thread
//! - [`WorkerPool`]: bounded set of threads for blocking callables
//! - [`Driver`]: the single thread that steps every routine
//! - Suspension primitives: [`sleep`], [`ensure_async`], [`network_request`], [`emit_header`]
//! - [`Stream`]: the consumer side of a task's output
//!
//! # Example
//! ```rust,no_run
//! # use pistonite_reel as reel;
//! use std::time::Duration;
//! use reel::{Context, Resume, Routine, Step};
//!
//! enum Slow { Start, Sleeping, Done }
//! impl Routine for Slow {
//!     fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
//!         match self {
//!             Slow::Start => {
//!                 *self = Slow::Sleeping;
//!                 reel::sleep(Duration::from_secs(1)).into()
//!             }
//!             Slow::Sleeping => {
//!                 *self = Slow::Done;
//!                 match input.into_value() {
//!                     Ok(elapsed) => Step::emit(format!("slept {elapsed}s\n")),
//!                     Err(e) => Step::Raise(e),
//!                 }
//!             }
//!             Slow::Done => Step::ret(()),
//!         }
//!     }
//! }
//!
//! reel::log_init("info");
//! for chunk in reel::Driver::global().stream(Slow::Start) {
//!     println!("{:?}", chunk?);
//! }
//! # Ok::<(), reel::Failure>(())
//! ```
//!
//! # Logging
//! Everything logs through the [`log`](https://docs.rs/log) facade. Use
//! [`log_init`] in binaries and tests to print to stderr, filtered by
//! `RUST_LOG` in the same way as [`env_logger`](https://docs.rs/env_logger/latest/env_logger/#enabling-logging).

mod error_handling;
pub use error_handling::*;

mod atomic;
mod misc;

mod value;
pub use value::Value;

mod cell;
pub use cell::{Cell, Outcome};

mod timer;
pub use timer::{FAR_FUTURE, OnFire, TimerHandle, TimerWheel};

mod pool;
pub use pool::{Job, WorkerContext, WorkerPool, worker_count};

mod routine;
pub use routine::*;

mod driver;
pub use driver::{Context, Driver, on_driver_thread};

mod stream;
pub use stream::Stream;

mod prim;
pub use prim::*;

/// File system routines
pub mod fs;

mod config;
pub use config::Config;

mod logging;
pub use logging::log_init;

// re-exports from libraries
pub use log::{debug, error, info, trace, warn};

/// Prelude imports
pub mod pre {
    pub use crate::ErrorContext as _;
}
