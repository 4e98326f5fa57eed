//! Timer wheel for sleep requests.
//!
//! Deadlines are kept in a min-heap, keyed on a monotonic clock
//! ([`Instant`]). A background thread parks until the earliest deadline,
//! then fires every due entry in deadline order. Entries with equal deadlines
//! fire in the order they were scheduled.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::ErrorContext as _;

/// Callback invoked on the timer thread when an entry fires, with the time
/// actually elapsed since it was scheduled
pub type OnFire = Box<dyn FnOnce(Duration) + Send + 'static>;

/// Handle to a scheduled timer entry, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    deadline: Instant,
    /// Insertion sequence, to break ties between equal deadlines
    seq: u64,
    scheduled_at: Instant,
    on_fire: OnFire,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

/// A min-heap of timer entries ordered by deadline.
///
/// Cancellation doesn't remove from the heap: the entry is dropped
/// from the live set, and skipped when it's popped.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    live: HashSet<u64>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn insert(&mut self, deadline: Instant, scheduled_at: Instant, on_fire: OnFire) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(TimerEntry {
            deadline,
            seq,
            scheduled_at,
            on_fire,
        });
        TimerHandle(seq)
    }

    /// Cancel an entry, returns false if it already fired or was cancelled
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.live.remove(&handle.0);
        if self.live.is_empty() {
            // nothing live anymore, drop the tombstones
            self.heap.clear();
        }
        removed
    }

    /// Number of live (not fired, not cancelled) entries
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Earliest deadline among live entries
    pub fn peek_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.live.contains(&entry.seq) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop all live entries with `deadline <= now`, earliest first
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerHandle, Instant, OnFire)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if self.live.remove(&entry.seq) {
                expired.push((TimerHandle(entry.seq), entry.scheduled_at, entry.on_fire));
            }
        }
        expired
    }
}

/// Schedules wake-ups after a requested delay.
///
/// The wheel can be cloned and shared between threads. Callbacks run on the
/// timer thread, so they should only hand the wake-up off (for example,
/// send a message to the driver), not do actual work.
#[derive(Clone)]
pub struct TimerWheel(Arc<TimerInner>);
struct TimerInner {
    state: Mutex<TimerState>,
    wake: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}
#[derive(Default)]
struct TimerState {
    queue: TimerQueue,
    shutdown: bool,
}

impl TimerWheel {
    /// Create the wheel and spawn its timer thread
    pub fn new(thread_name: impl Into<String>) -> crate::Result<Self> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        });
        let thread_name = thread_name.into();
        let handle = {
            let inner = Arc::clone(&inner);
            crate::check!(
                std::thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || timer_loop(&inner)),
                "failed to spawn timer thread '{thread_name}'"
            )?
        };
        *inner.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        crate::debug!("timer thread '{thread_name}' started");
        Ok(Self(inner))
    }

    /// Fire `on_fire` after `duration` has elapsed.
    ///
    /// A duration too large to be represented as a deadline is clamped
    /// to [`FAR_FUTURE`] from now.
    pub fn schedule<F>(&self, duration: Duration, on_fire: F) -> TimerHandle
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let now = Instant::now();
        self.schedule_inner(deadline_after(now, duration), now, Box::new(on_fire))
    }

    /// Fire `on_fire` at `deadline`. Entries at the same deadline fire in the
    /// order they are scheduled
    pub fn schedule_at<F>(&self, deadline: Instant, on_fire: F) -> TimerHandle
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.schedule_inner(deadline, Instant::now(), Box::new(on_fire))
    }

    fn schedule_inner(&self, deadline: Instant, scheduled_at: Instant, on_fire: OnFire) -> TimerHandle {
        let mut state = self.lock();
        let earliest = state.queue.peek_deadline();
        let handle = state.queue.insert(deadline, scheduled_at, on_fire);
        drop(state);
        // only need to re-arm the thread if the new entry is the earliest
        if earliest.is_none_or(|x| deadline < x) {
            self.0.wake.notify_one();
        }
        handle
    }

    /// Cancel a scheduled entry. This is best-effort: returns false
    /// if the entry already fired (or is firing)
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.lock().queue.cancel(handle)
    }

    /// Number of entries waiting to fire
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the timer thread. Entries that have not fired are dropped
    /// without firing.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.0.wake.notify_all();
        let handle = self.0.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            let _: Result<_, _> = handle.join();
            crate::debug!("timer thread stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Upper bound of a timer's delay, about 100 years
pub const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(now: Instant, duration: Duration) -> Instant {
    match now.checked_add(duration.min(FAR_FUTURE)) {
        Some(deadline) => deadline,
        None => {
            crate::warn!("timer delay of {duration:?} cannot be represented, clamping to one day");
            now.checked_add(Duration::from_secs(24 * 60 * 60)).unwrap_or(now)
        }
    }
}

fn timer_loop(inner: &TimerInner) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let Some(deadline) = state.queue.peek_deadline() else {
            state = inner.wake.wait(state).unwrap_or_else(|e| e.into_inner());
            continue;
        };
        if deadline > now {
            state = inner
                .wake
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
            continue;
        }
        let expired = state.queue.pop_expired(now);
        drop(state);
        for (handle, scheduled_at, on_fire) in expired {
            let elapsed = scheduled_at.elapsed();
            crate::trace!("timer {handle:?} fired after {elapsed:?}");
            let _: Result<_, _> = crate::misc::catch_panic("timer callback", move || on_fire(elapsed));
        }
        state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn queue_pops_earliest_first_with_ties_in_insertion_order() {
        let mut queue = TimerQueue::default();
        let base = Instant::now();
        let (send, recv) = mpsc::channel();
        for (name, offset) in [("c", 150), ("a1", 50), ("b", 100), ("a2", 50)] {
            let send = send.clone();
            queue.insert(
                base + Duration::from_millis(offset),
                base,
                Box::new(move |_| send.send(name).unwrap()),
            );
        }
        assert_eq!(queue.peek_deadline(), Some(base + Duration::from_millis(50)));
        let expired = queue.pop_expired(base + Duration::from_millis(100));
        assert_eq!(expired.len(), 3);
        for (_, _, f) in expired {
            f(Duration::ZERO);
        }
        let fired: Vec<_> = recv.try_iter().collect();
        assert_eq!(fired, vec!["a1", "a2", "b"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn queue_cancel_skips_entry() {
        let mut queue = TimerQueue::default();
        let base = Instant::now();
        let h1 = queue.insert(base, base, Box::new(|_| {}));
        let h2 = queue.insert(base, base, Box::new(|_| {}));
        assert!(queue.cancel(h1));
        assert!(!queue.cancel(h1));
        let expired = queue.pop_expired(base);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, h2);
        assert!(!queue.cancel(h2), "already fired");
    }

    #[test]
    fn fires_no_earlier_than_requested() {
        let wheel = TimerWheel::new("test-timer").unwrap();
        let (send, recv) = mpsc::channel();
        let start = Instant::now();
        wheel.schedule(Duration::from_millis(30), move |elapsed| {
            send.send(elapsed).unwrap();
        });
        let elapsed = recv.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(wheel.is_empty());
        wheel.shutdown();
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let wheel = TimerWheel::new("test-timer").unwrap();
        let (send, recv) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(20);
        for i in 0..5 {
            let send = send.clone();
            wheel.schedule_at(deadline, move |_| send.send(i).unwrap());
        }
        let fired: Vec<_> = (0..5)
            .map(|_| recv.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
        wheel.shutdown();
    }

    #[test]
    fn earlier_entry_rearms_thread() {
        let wheel = TimerWheel::new("test-timer").unwrap();
        let (send, recv) = mpsc::channel();
        let late = send.clone();
        wheel.schedule(Duration::from_secs(60), move |_| late.send("late").unwrap());
        wheel.schedule(Duration::from_millis(10), move |_| send.send("early").unwrap());
        assert_eq!(recv.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(wheel.len(), 1);
        wheel.shutdown();
    }

    #[test]
    fn huge_delay_is_clamped() {
        let wheel = TimerWheel::new("test-timer").unwrap();
        let handle = wheel.schedule(Duration::MAX, |_| {});
        wheel.schedule(Duration::from_secs_f64(1e19), |_| {});
        assert_eq!(wheel.len(), 2);
        assert!(wheel.cancel(handle));
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
        wheel.shutdown();
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let wheel = TimerWheel::new("test-timer").unwrap();
        let (send, recv) = mpsc::channel::<()>();
        let handle = wheel.schedule(Duration::from_millis(20), move |_| send.send(()).unwrap());
        assert!(wheel.cancel(handle));
        assert!(recv.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!wheel.cancel(handle));
        wheel.shutdown();
    }
}
