//! # Stream Adapter
//!
//! The consumer side of a task's output. Pulling a chunk grants the driver
//! demand for one more chunk, so the task only runs ahead of the consumer by
//! the configured `prefetch`.
//!
//! ```rust,no_run
//! # use pistonite_reel as reel;
//! let stream = reel::Driver::global().stream(reel::chunks(["a", "b"]));
//! let body = stream.read_to_end()?;
//! assert_eq!(body, b"ab");
//! # Ok::<(), reel::Error>(())
//! ```

use std::sync::mpsc::Sender;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::driver::{Msg, StreamId};
use crate::{Cell, Chunk, CoreError, Failure, Value};

/// What the driver sends to the consumer of a stream
pub(crate) enum StreamEvent {
    /// A chunk sent against demand
    Chunk(Chunk),
    /// Non-unit return value of the root task, delivered as the last chunk
    Trailer(Value),
    End,
    Error(Failure),
}

/// Lazily produced output of a task.
///
/// Each call to [`next_chunk`](Self::next_chunk) runs the task
/// just far enough to produce one chunk. The stream ends when the task returns.
/// If the task returns a value other than `Unit`, that value is
/// the final chunk. If it raises, the failure is the final item.
///
/// Dropping the stream before the end abandons the task. The stream keeps the
/// driver that produced it running until it is dropped.
pub struct Stream {
    id: StreamId,
    rx: UnboundedReceiver<StreamEvent>,
    tx: Sender<Msg>,
    cell: Cell,
    /// If demand was sent that is not answered yet
    outstanding: bool,
    done: bool,
    /// Keeps the driver running. Fields drop after `Drop::drop` sends the release
    driver: Option<crate::Driver>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, rx: UnboundedReceiver<StreamEvent>, tx: Sender<Msg>, cell: Cell) -> Self {
        Self {
            id,
            rx,
            tx,
            cell,
            outstanding: false,
            done: false,
            driver: None,
        }
    }

    /// Keep the driver running while this stream is alive
    pub(crate) fn keep_alive(mut self, driver: crate::Driver) -> Self {
        self.driver = Some(driver);
        self
    }

    /// The cell of the task producing this stream, settled with its return value
    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    /// If the end or a failure was reached
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Block the current thread until the next chunk.
    ///
    /// Returns `None` at the end of the stream. Must not be called from
    /// within an async runtime, use [`co_next_chunk`](Self::co_next_chunk) instead.
    pub fn next_chunk(&mut self) -> Option<Result<Chunk, Failure>> {
        if self.done {
            return None;
        }
        self.request();
        let event = match self.rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Disconnected) => return self.stopped(),
            Err(TryRecvError::Empty) => {
                if crate::driver::on_driver_thread() {
                    self.done = true;
                    return Some(Err(CoreError::WouldDeadlock.into()));
                }
                match self.rx.blocking_recv() {
                    Some(event) => event,
                    None => return self.stopped(),
                }
            }
        };
        self.accept(event)
    }

    /// Wait for the next chunk in an async context
    pub async fn co_next_chunk(&mut self) -> Option<Result<Chunk, Failure>> {
        if self.done {
            return None;
        }
        self.request();
        let event = match self.rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Disconnected) => return self.stopped(),
            Err(TryRecvError::Empty) => {
                match self.rx.recv().await {
                    Some(event) => event,
                    None => return self.stopped(),
                }
            }
        };
        self.accept(event)
    }

    /// Pull the stream to the end, concatenating the wire bytes of
    /// every data chunk
    pub fn read_to_end(mut self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk() {
            if let Chunk::Data(value) = chunk? {
                out.extend_from_slice(&value.to_bytes());
            }
        }
        Ok(out)
    }

    /// Grant demand for one chunk, replacing the one about to be consumed.
    /// At most one grant is unanswered at a time.
    fn request(&mut self) {
        if self.outstanding {
            return;
        }
        self.outstanding = true;
        if self.tx.send(Msg::Pull(self.id)).is_err() {
            crate::debug!("demand on stream {} not delivered, driver is gone", self.id);
        }
    }

    fn accept(&mut self, event: StreamEvent) -> Option<Result<Chunk, Failure>> {
        match event {
            StreamEvent::Chunk(chunk) => {
                self.outstanding = false;
                Some(Ok(chunk))
            }
            StreamEvent::Trailer(value) => Some(Ok(Chunk::Data(value))),
            StreamEvent::End => {
                self.done = true;
                None
            }
            StreamEvent::Error(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn stopped(&mut self) -> Option<Result<Chunk, Failure>> {
        self.done = true;
        Some(Err(CoreError::DriverStopped.into()))
    }
}

impl Iterator for Stream {
    type Item = Result<Chunk, Failure>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.done {
            crate::trace!("stream {} dropped before the end", self.id);
            let _: Result<_, _> = self.tx.send(Msg::Release(self.id));
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}
