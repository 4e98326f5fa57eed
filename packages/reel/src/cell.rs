//! Single-assignment result container

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{CoreError, Failure, Value};

/// The settled state of a [`Cell`]
pub type Outcome = Result<Value, Failure>;

type Subscriber = Box<dyn FnOnce(&Outcome) + Send + 'static>;

enum State {
    Pending(Vec<Subscriber>),
    /// Settled, with subscribers registered while the settling thread
    /// is still notifying
    Notifying(Outcome, Vec<Subscriber>),
    Settled(Outcome),
}

impl State {
    fn outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Pending(_) => None,
            Self::Notifying(outcome, _) | Self::Settled(outcome) => Some(outcome),
        }
    }
}

/// Write-once container for an eventual value or failure, with subscriber
/// notification.
///
/// Every invocation of a routine owns exactly one cell, and the driver
/// uses cells to wait for timers, worker jobs and child routines.
/// The cell can be cloned and shared between threads - clones refer to the same
/// underlying state.
///
/// Subscribers are invoked synchronously by the thread that settles the cell,
/// in the order they were registered. A subscriber registered while that thread
/// is still notifying is queued behind the others and run by the same thread.
/// Once notification is over, subscribing invokes the subscriber immediately on
/// the calling thread, so a notification is never missed.
#[derive(Clone)]
pub struct Cell(Arc<CellInner>);
struct CellInner {
    id: usize,
    state: Mutex<State>,
    settled: Condvar,
}

impl Cell {
    /// Create a new pending cell
    pub fn new() -> Self {
        Self(Arc::new(CellInner {
            id: crate::atomic::next_atomic_usize(),
            state: Mutex::new(State::Pending(Vec::new())),
            settled: Condvar::new(),
        }))
    }

    /// Create a cell that is already resolved
    pub fn resolved(value: impl Into<Value>) -> Self {
        Self::settled(Ok(value.into()))
    }

    /// Create a cell that is already failed
    pub fn failed(error: impl Into<Failure>) -> Self {
        Self::settled(Err(error.into()))
    }

    fn settled(outcome: Outcome) -> Self {
        Self(Arc::new(CellInner {
            id: crate::atomic::next_atomic_usize(),
            state: Mutex::new(State::Settled(outcome)),
            settled: Condvar::new(),
        }))
    }

    /// Process-unique id of the cell, used in log messages
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Resolve the cell with a value
    ///
    /// Errors with [`CoreError::AlreadySettled`] if the cell is not pending.
    pub fn resolve(&self, value: impl Into<Value>) -> Result<(), CoreError> {
        self.settle(Ok(value.into()))
    }

    /// Fail the cell with an error
    ///
    /// Errors with [`CoreError::AlreadySettled`] if the cell is not pending.
    pub fn fail(&self, error: impl Into<Failure>) -> Result<(), CoreError> {
        self.settle(Err(error.into()))
    }

    /// Settle the cell with an outcome
    pub fn settle(&self, outcome: Outcome) -> Result<(), CoreError> {
        if self.try_settle(outcome) {
            Ok(())
        } else {
            Err(CoreError::AlreadySettled)
        }
    }

    /// Settle the cell if it's still pending. Returns if this call settled it.
    ///
    /// This is used when multiple parties race to settle the same cell, where
    /// losing is expected and not an error.
    pub fn try_settle(&self, outcome: Outcome) -> bool {
        let mut batch = {
            let mut state = self.lock();
            let State::Pending(subscribers) = &mut *state else {
                return false;
            };
            let subscribers = std::mem::take(subscribers);
            *state = State::Notifying(outcome.clone(), Vec::new());
            subscribers
        };
        self.0.settled.notify_all();
        crate::trace!(
            "cell {} settled ({}), notifying {} subscriber(s)",
            self.0.id,
            if outcome.is_ok() { "resolved" } else { "failed" },
            batch.len()
        );
        loop {
            // subscribers run outside of the lock, so they are free to
            // subscribe to or settle other cells (or this one)
            for subscriber in batch {
                let _: crate::Result<()> =
                    crate::misc::catch_panic("cell subscriber", || subscriber(&outcome));
            }
            let mut state = self.lock();
            let late = match &mut *state {
                State::Notifying(_, late) => std::mem::take(late),
                _ => Vec::new(),
            };
            if late.is_empty() {
                *state = State::Settled(outcome.clone());
                break;
            }
            batch = late;
        }
        true
    }

    /// Register a callback to be invoked with the outcome.
    ///
    /// If the cell is already settled, the callback is invoked immediately.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(subscribers) | State::Notifying(_, subscribers) => {
                    subscribers.push(Box::new(callback));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    /// Check if the cell is resolved or failed
    pub fn is_settled(&self) -> bool {
        self.lock().outcome().is_some()
    }

    /// Get the outcome if the cell is settled
    pub fn peek(&self) -> Option<Outcome> {
        self.lock().outcome().cloned()
    }

    /// Block the current thread until the cell is settled.
    ///
    /// # Blocking
    /// This is meant for synchronous code outside of routines. Calling it
    /// from the driver thread would stall every task, so it errors with
    /// [`CoreError::WouldDeadlock`] there instead. Inside an async context,
    /// use [`co_wait().await`](Self::co_wait).
    pub fn wait_blocking(&self) -> Outcome {
        if crate::driver::on_driver_thread() {
            return Err(CoreError::WouldDeadlock.into());
        }
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome.clone();
            }
            state = self
                .0
                .settled
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`wait_blocking`](Self::wait_blocking), but give up after `timeout`,
    /// returning `None` if the cell is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        if crate::driver::on_driver_thread() {
            return Some(Err(CoreError::WouldDeadlock.into()));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .0
                .settled
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Wait for the cell asynchronously
    pub async fn co_wait(&self) -> Outcome {
        let (send, recv) = tokio::sync::oneshot::channel();
        self.subscribe(move |outcome| {
            let _: Result<_, _> = send.send(outcome.clone());
        });
        match recv.await {
            Ok(outcome) => outcome,
            // the subscriber is dropped without being called only if
            // the cell itself is gone, which can't happen while we hold it
            Err(_) => Err(CoreError::Abandoned.into()),
        }
    }

    /// Race multiple cells.
    ///
    /// The returned cell settles as soon as any input settles: with
    /// `List([Int(index), value])` if input `index` resolved first, or with its failure
    /// if it failed first. Later outcomes are discarded.
    ///
    /// Timeouts are composed by racing a timer cell against the work.
    /// An empty input produces a cell that never settles.
    pub fn first_of<I: IntoIterator<Item = Cell>>(cells: I) -> Cell {
        let winner = Cell::new();
        for (index, cell) in cells.into_iter().enumerate() {
            let winner = winner.clone();
            cell.subscribe(move |outcome| {
                let outcome = outcome
                    .clone()
                    .map(|value| Value::List(vec![Value::from(index), value]));
                winner.try_settle(outcome);
            });
        }
        winner
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // subscribers never run under the lock, so poisoning can only come
        // from a panic in our own bookkeeping, which leaves the state intact
        self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.lock().outcome() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Cell")
            .field("id", &self.0.id)
            .field("state", &state)
            .finish()
    }
}
