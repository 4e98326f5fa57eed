use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pistonite_reel as reel;
use reel::{Cell, Chunk, Config, CoreError, Resume, Step, Value};

mod common;
use common::*;

#[test]
fn test_delegation_interleaves_in_order() {
    let d = driver();
    let mut n = 0;
    let outer = reel::routine_fn("outer", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("a1"),
            2 => reel::delegate(reel::chunks(["b1", "b2"])).into(),
            3 => Step::emit("a2"),
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(outer)), ["a1", "b1", "b2", "a2"]);
    d.shutdown();
}

#[test]
fn test_delegate_resumes_with_return_value() {
    let d = driver();
    let mut n = 0;
    let parent = reel::routine_fn("parent", move |_, input| {
        n += 1;
        match n {
            1 => reel::delegate(calculator(2, 2, ms(10))).into(),
            2 => match input.into_value() {
                Ok(v) => Step::emit(format!("result: {v}")),
                Err(e) => Step::Raise(e),
            },
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(parent)), ["result: 4"]);
    d.shutdown();
}

#[test]
fn test_quiet_delegate_discards_chunks() {
    let d = driver();
    let mut n = 0;
    let parent = reel::routine_fn("parent", move |_, input| {
        n += 1;
        match n {
            1 => reel::delegate_quiet(reel::chunks(["hidden"])).into(),
            2 => Step::emit(format!("child returned '{}'", input.into_value().unwrap_or_default())),
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(parent)), ["child returned ''"]);
    d.shutdown();
}

#[test]
fn test_sleep_resumes_with_elapsed_time() {
    let d = driver();
    let mut started = false;
    let sleeper = reel::routine_fn("sleeper", move |_, input| {
        if !started {
            started = true;
            return reel::sleep(ms(30)).into();
        }
        Step::Return(input.into_value().unwrap_or_default())
    });
    let start = Instant::now();
    let value = d.spawn(sleeper).wait_blocking().unwrap();
    assert!(start.elapsed() >= ms(30));
    match value {
        Value::Elapsed(elapsed) => assert!(elapsed >= ms(30), "{elapsed:?}"),
        other => panic!("expected elapsed time, got {other:?}"),
    }
    d.shutdown();
}

#[test]
fn test_negative_sleep_resumes_immediately() {
    let d = driver();
    let mut started = false;
    let sleeper = reel::routine_fn("sleeper", move |_, input| {
        if !started {
            started = true;
            return reel::sleep_secs(-5.0).into();
        }
        Step::Return(input.into_value().unwrap_or_default())
    });
    let value = d.spawn(sleeper).wait_timeout(Duration::from_secs(2));
    let value = value.expect("negative sleep should not wait").unwrap();
    assert!(value.as_secs_f64().unwrap() < 1.0);
    d.shutdown();
}

#[test]
fn test_non_finite_sleep_raises() {
    let d = driver();
    let sleeper = reel::routine_fn("sleeper", |_, _| reel::sleep_secs(f64::INFINITY).into());
    let e = d.spawn(sleeper).wait_blocking().unwrap_err();
    assert_eq!(e.core(), Some(&CoreError::InvalidDuration(f64::INFINITY)));
    d.shutdown();
}

#[test]
fn test_raise_ends_stream_after_error() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("failing", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("one"),
            _ => Step::raise(reel::fmterr!("boom")),
        }
    });
    let mut stream = d.stream(r);
    assert_eq!(stream.next_chunk().unwrap().unwrap(), Chunk::Data("one".into()));
    let e = stream.next_chunk().unwrap().unwrap_err();
    assert_eq!(e.to_string(), "boom");
    assert!(stream.next_chunk().is_none());
    assert!(stream.next_chunk().is_none());
    assert!(stream.cell().peek().unwrap().is_err());
    d.shutdown();
}

#[test]
fn test_panic_in_step_becomes_failure() {
    let d = driver();
    let r = reel::routine_fn("panicking", |_, _| panic!("kaboom"));
    let e = d.spawn(r).wait_blocking().unwrap_err();
    assert!(e.to_string().contains("kaboom"), "{e}");
    // the driver keeps going
    let ok = d.spawn(reel::routine_fn("fine", |_, _| Step::ret(1)));
    assert_eq!(ok.wait_blocking().unwrap(), Value::Int(1));
    d.shutdown();
}

#[test]
fn test_huge_sleep_is_clamped() {
    let d = driver();
    let sleepers = [
        d.spawn(reel::routine_fn("huge", |_, _| reel::sleep_secs(1e19).into())),
        d.spawn(reel::routine_fn("max", |_, _| reel::sleep(Duration::MAX).into())),
    ];
    assert!(eventually(|| d.timer().len() == 2));
    assert!(d.is_running());
    // other tasks are not affected
    let sum = d.spawn(calculator(2, 3, ms(5)));
    assert_eq!(sum.wait_blocking().unwrap(), Value::Int(5));
    for cell in &sleepers {
        assert!(!cell.is_settled());
    }
    d.shutdown();
    for cell in sleepers {
        let e = cell.wait_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert_eq!(e.core(), Some(&CoreError::DriverStopped));
    }
}

struct PanicOnDrop;

impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        panic!("dropped");
    }
}

#[test]
fn test_panic_when_dropping_routine_is_contained() {
    let d = driver();
    let guard = PanicOnDrop;
    let r = reel::routine_fn("drop-panics", move |_, _| {
        let _guard = &guard;
        Step::ret(7)
    });
    assert_eq!(d.spawn(r).wait_blocking().unwrap(), Value::Int(7));
    let stream = d.stream(calculator(1, 2, ms(5)));
    assert_eq!(render(stream), ["3"]);
    assert!(d.is_running());
    d.shutdown();
}

#[test]
fn test_offload_failure_can_be_caught() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("catcher", move |_, input| {
        n += 1;
        match n {
            1 => reel::run_on_thread(|_| reel::bail!("disk on fire")).into(),
            2 => match input {
                Resume::Error(e) => Step::emit(format!("caught: {e}")),
                _ => Step::emit("not caught"),
            },
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(r)), ["caught: disk on fire"]);
    d.shutdown();
}

#[test]
fn test_uncaught_child_failure_propagates() {
    let d = driver();
    let mut n = 0;
    let child = reel::routine_fn("child", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("partial"),
            _ => Step::raise(reel::fmterr!("child failed")),
        }
    });
    let mut child = Some(child);
    let parent = reel::routine_fn("parent", move |_, input| match child.take() {
        Some(child) => reel::delegate(child).into(),
        None => match input.into_value() {
            Ok(_) => Step::emit("unreachable"),
            Err(e) => Step::Raise(e),
        },
    });
    assert_eq!(render(d.stream(parent)), ["partial", "!child failed"]);
    d.shutdown();
}

#[test]
fn test_return_value_is_final_chunk() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("answer", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("x"),
            _ => Step::ret(42),
        }
    });
    let stream = d.stream(r);
    let cell = stream.cell().clone();
    assert_eq!(render(stream), ["x", "42"]);
    assert_eq!(cell.peek().unwrap().unwrap(), Value::Int(42));

    // unit adds nothing
    assert_eq!(render(d.stream(reel::chunks(["only"]))), ["only"]);
    assert!(render(d.stream(reel::chunks(Vec::<String>::new()))).is_empty());
    d.shutdown();
}

#[test]
fn test_stream_is_lazy() {
    let d = driver();
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);
    let r = reel::routine_fn("counter", move |_, _| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n >= 100 {
            return Step::ret(());
        }
        Step::emit(n)
    });
    let mut stream = d.stream(r);
    std::thread::sleep(ms(50));
    assert!(produced.load(Ordering::SeqCst) <= 1);
    for i in 0..5 {
        let chunk = stream.next_chunk().unwrap().unwrap();
        assert_eq!(chunk, Chunk::Data(Value::from(i)));
    }
    std::thread::sleep(ms(50));
    assert!(produced.load(Ordering::SeqCst) <= 6);
    d.shutdown();
}

#[test]
fn test_prefetch_runs_ahead() {
    let d = driver_with(Config {
        prefetch: 3,
        ..Default::default()
    });
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);
    let r = reel::routine_fn("counter", move |_, _| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n >= 100 {
            return Step::ret(());
        }
        Step::emit(n)
    });
    let mut stream = d.stream(r);
    assert!(eventually(|| produced.load(Ordering::SeqCst) == 4));
    std::thread::sleep(ms(50));
    assert_eq!(produced.load(Ordering::SeqCst), 4);
    // every chunk taken is replaced, so the lead stays the same
    for i in 0..10 {
        let chunk = stream.next_chunk().unwrap().unwrap();
        assert_eq!(chunk, Chunk::Data(Value::from(i)));
    }
    assert!(eventually(|| produced.load(Ordering::SeqCst) == 14));
    std::thread::sleep(ms(50));
    assert_eq!(produced.load(Ordering::SeqCst), 14);
    assert_eq!(render(stream).len(), 90);
    d.shutdown();
}

#[test]
fn test_dropping_stream_abandons_task() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("slow", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("first"),
            2 => reel::sleep(Duration::from_secs(60)).into(),
            _ => Step::emit("never"),
        }
    });
    let mut stream = d.stream(r);
    assert_eq!(stream.next_chunk().unwrap().unwrap(), Chunk::Data("first".into()));
    assert!(eventually(|| d.timer().len() == 1));
    let cell = stream.cell().clone();
    drop(stream);
    let outcome = cell.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.unwrap_err().core(), Some(&CoreError::Abandoned));
    // the sleep was cancelled
    assert!(eventually(|| d.timer().is_empty()));
    d.shutdown();
}

#[test]
fn test_abandoned_task_skips_queued_job() {
    let d = driver();
    let blockers: Vec<Cell> = (0..2)
        .map(|_| {
            d.spawn(reel::routine_fn("blocker", |_, input| match input {
                Resume::Start => reel::run_on_thread(|_| {
                    std::thread::sleep(ms(300));
                    Ok(Value::Unit)
                })
                .into(),
                _ => Step::ret(()),
            }))
        })
        .collect();
    assert!(eventually(|| d.pool().in_flight() == 2));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let mut n = 0;
    let r = reel::routine_fn("queued", move |_, _| {
        n += 1;
        match n {
            1 => Step::emit("first"),
            2 => {
                let flag = Arc::clone(&flag);
                reel::run_on_thread(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Unit)
                })
                .into()
            }
            _ => Step::ret(()),
        }
    });
    let mut stream = d.stream(r);
    assert_eq!(stream.next_chunk().unwrap().unwrap(), Chunk::Data("first".into()));
    // both workers are busy, so the job waits in the queue
    assert!(eventually(|| d.pool().in_flight() == 3));
    let cell = stream.cell().clone();
    drop(stream);
    let outcome = cell.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.unwrap_err().core(), Some(&CoreError::Abandoned));

    for blocker in blockers {
        assert_eq!(blocker.wait_blocking().unwrap(), Value::Unit);
    }
    assert!(eventually(|| d.pool().in_flight() == 0));
    assert!(!ran.load(Ordering::SeqCst));
    d.shutdown();
}

#[test]
fn test_spawned_tasks_run_independently() {
    let d = driver();
    let mut n = 0;
    let mut cells: Vec<Cell> = Vec::new();
    let r = reel::routine_fn("joiner", move |cx, input| {
        n += 1;
        match n {
            1 => {
                cells.push(cx.spawn(calculator(1, 2, ms(5))));
                cells.push(cx.spawn(reel::chunks(["hidden"])));
                Step::emit("spawned")
            }
            2 => reel::await_cell(cells[0].clone()).into(),
            3 => match input.into_value() {
                Ok(v) => Step::Return(v),
                Err(e) => Step::Raise(e),
            },
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(r)), ["spawned", "3"]);
    d.shutdown();
}

#[test]
fn test_race_timer_against_slow_work() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("race", move |cx, input| {
        n += 1;
        if n == 1 {
            let slow = match cx.offload(|_| {
                std::thread::sleep(ms(300));
                Ok(Value::from("slow"))
            }) {
                Ok(cell) => cell,
                Err(e) => return Step::raise(e),
            };
            let timeout = cx.timer(ms(20));
            return reel::await_cell(Cell::first_of([slow, timeout])).into();
        }
        match input.into_value() {
            Ok(Value::List(items)) => Step::Return(items[0].clone()),
            Ok(other) => Step::raise(reel::fmterr!("unexpected {other:?}")),
            Err(e) => Step::Raise(e),
        }
    });
    assert_eq!(d.spawn(r).wait_blocking().unwrap(), Value::Int(1));
    d.shutdown();
}

#[test]
fn test_losing_timer_is_cancelled() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("race", move |cx, input| {
        n += 1;
        if n == 1 {
            let quick = match cx.offload(|_| Ok(Value::from("quick"))) {
                Ok(cell) => cell,
                Err(e) => return Step::raise(e),
            };
            let timeout = cx.timer(Duration::from_secs(60));
            return reel::await_cell(Cell::first_of([quick, timeout])).into();
        }
        match input.into_value() {
            Ok(Value::List(items)) => Step::Return(items[0].clone()),
            Ok(other) => Step::raise(reel::fmterr!("unexpected {other:?}")),
            Err(e) => Step::Raise(e),
        }
    });
    assert_eq!(d.spawn(r).wait_blocking().unwrap(), Value::Int(0));
    assert!(eventually(|| d.timer().is_empty()));
    d.shutdown();
}

#[test]
fn test_abandoned_task_cancels_its_timers() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("timeouts", move |cx, _| {
        n += 1;
        match n {
            1 => {
                let _ = cx.timer(Duration::from_secs(60));
                Step::emit("armed")
            }
            _ => reel::sleep(Duration::from_secs(60)).into(),
        }
    });
    let mut stream = d.stream(r);
    assert_eq!(stream.next_chunk().unwrap().unwrap(), Chunk::Data("armed".into()));
    assert!(eventually(|| d.timer().len() == 2));
    drop(stream);
    assert!(eventually(|| d.timer().is_empty()));
    d.shutdown();
}

#[test]
fn test_blocking_wait_on_driver_thread_is_refused() {
    let d = driver();
    let r = reel::routine_fn("deadlock", |_, _| {
        let cell = Cell::new();
        match cell.wait_blocking() {
            Err(e) => Step::ret(e.core() == Some(&CoreError::WouldDeadlock)),
            Ok(_) => Step::ret(false),
        }
    });
    assert_eq!(d.spawn(r).wait_blocking().unwrap(), Value::Bool(true));
    d.shutdown();
}

#[test]
fn test_coroutine_factory() {
    let d = driver();
    let greet = reel::coroutine("greet", |name: String| reel::chunks([format!("hello {name}\n")]));
    assert_eq!(greet.name(), "greet");
    assert_eq!(render(greet.stream(&d, "world".to_string())), ["hello world\n"]);
    assert_eq!(greet.call(&d, "quiet".to_string()).wait_blocking().unwrap(), Value::Unit);

    let twice = greet.clone();
    let mut n = 0;
    let r = reel::routine_fn("twice", move |_, _| {
        n += 1;
        match n {
            1 => twice.delegate("a".to_string()).into(),
            2 => twice.delegate("b".to_string()).into(),
            _ => Step::ret(()),
        }
    });
    assert_eq!(render(d.stream(r)), ["hello a\n", "hello b\n"]);
    d.shutdown();
}

#[test]
fn test_stream_blocking_callable() {
    let d = driver();
    let stream = d.stream_blocking(|cx| Ok(Value::from(cx.worker.clone())));
    assert_eq!(render(stream), ["test-worker"]);
    let stream = d.stream_blocking(|_| reel::bail!("nope"));
    assert_eq!(render(stream), ["!nope"]);
    d.shutdown();
}

#[test]
fn test_shutdown_fails_pending_tasks() {
    let d = driver();
    let r = reel::routine_fn("forever", |_, _| reel::sleep(Duration::from_secs(60)).into());
    let cell = d.spawn(r);
    assert!(eventually(|| d.timer().len() == 1));
    assert!(d.is_running());
    d.shutdown();
    assert!(!d.is_running());
    let e = cell.wait_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert_eq!(e.core(), Some(&CoreError::DriverStopped));

    let late = d.spawn(reel::chunks(["late"]));
    assert_eq!(late.peek().unwrap().unwrap_err().core(), Some(&CoreError::DriverStopped));
    let stream = d.stream(reel::chunks(["late"]));
    assert_eq!(render(stream), ["!driver is not running"]);
}

#[test]
fn test_stream_keeps_driver_alive() {
    // the only handle is a temporary, dropped at the end of the statement
    let stream = driver().stream(calculator(1, 2, ms(20)));
    std::thread::sleep(ms(20));
    assert_eq!(render(stream), ["3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_consumer() {
    let d = driver();
    let mut n = 0;
    let r = reel::routine_fn("async", move |_, _| {
        n += 1;
        match n {
            1 => reel::emit_header(),
            2 => Step::emit("body"),
            3 => reel::sleep(ms(10)).into(),
            _ => Step::ret("done"),
        }
    });
    let mut stream = d.stream(r);
    let mut items = Vec::new();
    while let Some(chunk) = stream.co_next_chunk().await {
        items.push(chunk.unwrap());
    }
    assert_eq!(
        items,
        [Chunk::Header, Chunk::Data("body".into()), Chunk::Data("done".into())]
    );
    assert_eq!(stream.cell().co_wait().await.unwrap(), Value::from("done"));
    let d2 = d.clone();
    tokio::task::spawn_blocking(move || d2.shutdown()).await.unwrap();
}
