use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;

use tokio::sync::mpsc::UnboundedSender;

use super::{Env, Msg, StreamId, TaskId, TaskSpawn};
use crate::stream::StreamEvent;
use crate::{
    Cell, Chunk, Context, CoreError, Forward, Outcome, Resume, Routine, Step, Suspension, Target,
    TimerHandle, Value,
};

/// What a task is waiting for
enum Wait {
    /// In the run queue
    Ready,
    /// A sleep
    Timer(TimerHandle),
    /// A cell: a delegated routine or an existing cell
    Cell,
    /// An offloaded callable. Setting the flag skips it if it hasn't started yet
    Job(Arc<AtomicBool>),
    /// Demand from the consumer, holding the chunk to deliver
    Credit(Chunk),
}

struct Task {
    routine: Box<dyn Routine>,
    cell: Cell,
    /// Where emitted chunks go. `None` discards them
    sink: Option<StreamId>,
    /// The task that delegated to this one
    parent: Option<TaskId>,
    /// If this task started the stream. Only the root ends it
    root: bool,
    wait: Wait,
    /// Timers created with `Context::timer`, cancelled when the task ends
    timers: Vec<(TimerHandle, Cell)>,
}

struct Sink {
    tx: UnboundedSender<StreamEvent>,
    /// Chunks that can be sent without waiting for demand
    credit: usize,
    parked: Option<TaskId>,
}

struct Leftover {
    sink: Option<StreamId>,
    root: bool,
}

enum Offer {
    Sent,
    Parked(Chunk),
    Closed,
}

/// State of the driver thread
pub(crate) struct Trampoline {
    env: Env,
    rx: Receiver<Msg>,
    tasks: HashMap<TaskId, Task>,
    sinks: HashMap<StreamId, Sink>,
    ready: VecDeque<(TaskId, Resume)>,
}

impl Trampoline {
    pub fn new(env: Env, rx: Receiver<Msg>) -> Self {
        Self {
            env,
            rx,
            tasks: HashMap::new(),
            sinks: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn run(mut self) {
        crate::debug!("driver loop started");
        loop {
            // messages first, so wake-ups and demand are seen before the next step
            while let Ok(msg) = self.rx.try_recv() {
                if !self.handle(msg) {
                    return self.stop();
                }
            }
            if let Some((id, input)) = self.ready.pop_front() {
                self.advance(id, input);
                continue;
            }
            match self.rx.recv() {
                Ok(msg) => {
                    if !self.handle(msg) {
                        return self.stop();
                    }
                }
                Err(_) => return self.stop(),
            }
        }
    }

    /// Returns false on shutdown
    fn handle(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Spawn(task) => self.start(task, None, None, false),
            Msg::Open { stream, sink, root } => {
                self.sinks.insert(
                    stream,
                    Sink {
                        tx: sink,
                        credit: self.env.config.prefetch,
                        parked: None,
                    },
                );
                self.start(root, Some(stream), None, true);
            }
            Msg::Wake { task, outcome } => self.wake(task, outcome),
            Msg::Pull(stream) => self.pull(stream),
            Msg::Release(stream) => self.release(stream, CoreError::Abandoned),
            Msg::Shutdown => return false,
        }
        true
    }

    fn start(&mut self, spawn: TaskSpawn, sink: Option<StreamId>, parent: Option<TaskId>, root: bool) {
        let TaskSpawn { id, routine, cell } = spawn;
        crate::trace!("starting task {id} ({})", routine.name());
        self.tasks.insert(
            id,
            Task {
                routine,
                cell,
                sink,
                parent,
                root,
                wait: Wait::Ready,
                timers: Vec::new(),
            },
        );
        self.ready.push_back((id, Resume::Start));
    }

    fn wake(&mut self, id: TaskId, outcome: Outcome) {
        let Some(task) = self.tasks.get_mut(&id) else {
            crate::debug!("ignoring wake-up for finished or abandoned task {id}");
            return;
        };
        if !matches!(task.wait, Wait::Timer(_) | Wait::Cell | Wait::Job(_)) {
            crate::warn!("ignoring unexpected wake-up for task {id}");
            return;
        }
        task.wait = Wait::Ready;
        let input = match outcome {
            Ok(v) => Resume::Value(v),
            Err(e) => Resume::Error(e),
        };
        self.ready.push_back((id, input));
    }

    /// Step a task until it suspends, parks or finishes
    fn advance(&mut self, id: TaskId, mut input: Resume) {
        let Some(mut task) = self.tasks.remove(&id) else {
            crate::debug!("skipping step of abandoned task {id}");
            return;
        };
        loop {
            crate::trace!("stepping task {id} ({})", task.routine.name());
            let step = {
                let mut cx = Context::new(id, &self.env);
                let routine = &mut task.routine;
                let step = crate::misc::catch_panic("routine step", || routine.resume(&mut cx, input));
                task.timers.retain(|(_, cell)| !cell.is_settled());
                task.timers.extend(cx.take_timers());
                step
            };
            let step = step.unwrap_or_else(|e| Step::Raise(e.into()));
            match step {
                Step::Emit(chunk) => match self.offer(id, &task, chunk) {
                    Offer::Sent => input = Resume::Continue,
                    Offer::Parked(chunk) => {
                        task.wait = Wait::Credit(chunk);
                        break;
                    }
                    Offer::Closed => {
                        let stream = task.sink;
                        self.tasks.insert(id, task);
                        if let Some(stream) = stream {
                            self.release(stream, CoreError::Abandoned);
                        }
                        return;
                    }
                },
                Step::Suspend(suspension) => {
                    crate::trace!("task {id} suspended on {suspension:?}");
                    let suspended = crate::misc::catch_panic("suspension", || {
                        self.suspend(id, &mut task, suspension)
                    });
                    match suspended {
                        Ok(Some(resume)) => input = resume,
                        Ok(None) => break,
                        Err(e) => {
                            task.wait = Wait::Ready;
                            input = Resume::Error(e.into());
                        }
                    }
                }
                Step::Return(value) => return self.finish(id, task, Ok(value)),
                Step::Raise(error) => return self.finish(id, task, Err(error)),
            }
        }
        self.tasks.insert(id, task);
    }

    fn offer(&mut self, id: TaskId, task: &Task, chunk: Chunk) -> Offer {
        let Some(stream) = task.sink else {
            return Offer::Sent;
        };
        let Some(sink) = self.sinks.get_mut(&stream) else {
            return Offer::Closed;
        };
        if sink.credit == 0 {
            crate::trace!("task {id} parked, waiting for demand on stream {stream}");
            if let Some(other) = sink.parked.replace(id) {
                crate::warn!("stream {stream} already had task {other} parked");
            }
            return Offer::Parked(chunk);
        }
        sink.credit -= 1;
        match sink.tx.send(StreamEvent::Chunk(chunk)) {
            Ok(()) => Offer::Sent,
            Err(_) => Offer::Closed,
        }
    }

    /// Register the suspension. Returns the input to resume with right away,
    /// if it can't be waited on
    fn suspend(&mut self, id: TaskId, task: &mut Task, suspension: Suspension) -> Option<Resume> {
        match suspension {
            Suspension::Sleep(duration) => {
                let tx = self.env.tx.clone();
                let handle = self.env.timer.schedule(duration, move |elapsed| {
                    let outcome = Ok(Value::Elapsed(elapsed));
                    let _: Result<_, _> = tx.send(Msg::Wake { task: id, outcome });
                });
                task.wait = Wait::Timer(handle);
                None
            }
            Suspension::Delegate { target, forward } => {
                let cell = match target {
                    Target::Cell(cell) => cell,
                    Target::Routine(routine) => {
                        let child = Env::task(routine);
                        let cell = child.cell.clone();
                        let sink = match forward {
                            Forward::Live => task.sink,
                            Forward::Discard => None,
                        };
                        self.start(child, sink, Some(id), false);
                        cell
                    }
                };
                self.wake_on(id, &cell);
                task.wait = Wait::Cell;
                None
            }
            Suspension::Offload(job) => {
                let cancelled = Arc::new(AtomicBool::new(false));
                let skip = Arc::clone(&cancelled);
                let job: crate::Job = Box::new(move |cx| {
                    if skip.load(Ordering::Acquire) {
                        crate::debug!("skipping job {} of abandoned task {id}", cx.job);
                        return Err(CoreError::Abandoned.into());
                    }
                    job(cx)
                });
                match self.env.pool.submit_job(job) {
                    Ok(cell) => {
                        self.wake_on(id, &cell);
                        task.wait = Wait::Job(cancelled);
                        None
                    }
                    Err(e) => Some(Resume::Error(e.into())),
                }
            }
        }
    }

    fn wake_on(&self, id: TaskId, cell: &Cell) {
        let tx = self.env.tx.clone();
        cell.subscribe(move |outcome| {
            let outcome = outcome.clone();
            let _: Result<_, _> = tx.send(Msg::Wake { task: id, outcome });
        });
    }

    fn finish(&mut self, id: TaskId, task: Task, outcome: Outcome) {
        match &outcome {
            Ok(value) => crate::trace!("task {id} ({}) returned {value}", task.routine.name()),
            Err(e) => crate::debug!("task {id} ({}) raised: {e}", task.routine.name()),
        }
        if let Err(e) = task.cell.settle(outcome.clone()) {
            crate::debug!("result of task {id} was settled elsewhere: {e}");
        }
        let Leftover { sink, root } = self.discard(id, task);
        if !root {
            return;
        }
        let Some(sink) = sink.and_then(|stream| self.sinks.remove(&stream)) else {
            return;
        };
        // the consumer may be gone already, which is fine
        match outcome {
            Ok(value) => {
                if !value.is_unit() {
                    let _: Result<_, _> = sink.tx.send(StreamEvent::Trailer(value));
                }
                let _: Result<_, _> = sink.tx.send(StreamEvent::End);
            }
            Err(e) => {
                let _: Result<_, _> = sink.tx.send(StreamEvent::Error(e));
            }
        }
    }

    fn pull(&mut self, stream: StreamId) {
        let Some(sink) = self.sinks.get_mut(&stream) else {
            crate::trace!("ignoring demand on finished stream {stream}");
            return;
        };
        sink.credit += 1;
        let Some(id) = sink.parked.take() else {
            return;
        };
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let chunk = match std::mem::replace(&mut task.wait, Wait::Ready) {
            Wait::Credit(chunk) => chunk,
            other => {
                task.wait = other;
                crate::warn!("task {id} was parked on stream {stream} but is not waiting for demand");
                return;
            }
        };
        sink.credit -= 1;
        if sink.tx.send(StreamEvent::Chunk(chunk)).is_err() {
            self.release(stream, CoreError::Abandoned);
            return;
        }
        self.ready.push_back((id, Resume::Continue));
    }

    /// Remove the stream and abandon every task writing to it,
    /// including children they delegated to
    fn release(&mut self, stream: StreamId, error: CoreError) {
        let sink = self.sinks.remove(&stream);
        let mut doomed: HashSet<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.sink == Some(stream))
            .map(|(id, _)| *id)
            .collect();
        loop {
            let children: Vec<_> = self
                .tasks
                .iter()
                .filter(|(id, task)| {
                    !doomed.contains(*id) && task.parent.is_some_and(|p| doomed.contains(&p))
                })
                .map(|(id, _)| *id)
                .collect();
            if children.is_empty() {
                break;
            }
            doomed.extend(children);
        }
        if !doomed.is_empty() {
            crate::debug!("stream {stream} released, abandoning {} task(s)", doomed.len());
        }
        for id in doomed {
            if let Some(task) = self.tasks.remove(&id) {
                self.abandon(id, task, error.clone());
            }
        }
        if let Some(sink) = sink {
            let _: Result<_, _> = sink.tx.send(StreamEvent::Error(error.into()));
        }
    }

    fn abandon(&self, id: TaskId, task: Task, error: CoreError) {
        crate::trace!("abandoning task {id} ({})", task.routine.name());
        match &task.wait {
            Wait::Timer(handle) => {
                self.env.timer.cancel(*handle);
            }
            Wait::Job(cancelled) => cancelled.store(true, Ordering::Release),
            _ => {}
        }
        task.cell.try_settle(Err(error.into()));
        self.discard(id, task);
    }

    /// Cancel the task's leftover timers and drop its routine.
    /// Returns what's left of the task
    fn discard(&self, id: TaskId, task: Task) -> Leftover {
        let Task {
            routine,
            sink,
            root,
            timers,
            ..
        } = task;
        for (handle, cell) in timers {
            if !cell.is_settled() && self.env.timer.cancel(handle) {
                crate::trace!("cancelled timer of task {id}");
            }
        }
        // dropping user state can panic, too
        let _: Result<_, _> = crate::misc::catch_panic("routine drop", move || drop(routine));
        Leftover { sink, root }
    }

    fn stop(mut self) {
        let streams: Vec<_> = self.sinks.keys().copied().collect();
        for stream in streams {
            self.release(stream, CoreError::DriverStopped);
        }
        for (id, task) in std::mem::take(&mut self.tasks) {
            self.abandon(id, task, CoreError::DriverStopped);
        }
        crate::debug!("driver loop stopped");
    }
}
