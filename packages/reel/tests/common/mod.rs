#![allow(dead_code)]

use std::time::{Duration, Instant};

use pistonite_reel as reel;
use reel::{Chunk, Config, Driver, Routine, Step, Stream};

pub fn ms(x: u64) -> Duration {
    Duration::from_millis(x)
}

/// A driver with its own threads, named `test-*`
pub fn driver() -> Driver {
    driver_with(Config::default())
}

pub fn driver_with(config: Config) -> Driver {
    reel::log_init("pistonite_reel=debug");
    Driver::new(Config {
        workers: 2,
        thread_prefix: "test".to_string(),
        ..config
    })
    .unwrap()
}

/// Pull everything from the stream. Data chunks are rendered with their display form,
/// header markers as `<header>` and a failure as `!` followed by the message
pub fn render(stream: Stream) -> Vec<String> {
    stream
        .map(|item| match item {
            Ok(Chunk::Header) => "<header>".to_string(),
            Ok(Chunk::Data(v)) => v.to_string(),
            Err(e) => format!("!{e}"),
        })
        .collect()
}

/// Poll `f` until it's true, for up to 5 seconds
pub fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if f() {
            return true;
        }
        std::thread::sleep(ms(5));
    }
    false
}

/// Sleeps, then returns the sum
pub fn calculator(a: i64, b: i64, delay: Duration) -> impl Routine {
    let mut slept = false;
    reel::routine_fn("calculator", move |_, input| {
        if !slept {
            slept = true;
            return reel::sleep(delay).into();
        }
        match input.into_value() {
            Ok(_) => Step::ret(a + b),
            Err(e) => Step::Raise(e),
        }
    })
}
