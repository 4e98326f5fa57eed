//! The example routes, and the loop that serves a route's stream

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reel::pre::*;
use reel::{AsyncUnit, Chunk, Context, Ensure, Resume, Routine, Step, Stream, Value};

/// A route: the response content type and the routine producing the body
pub struct Route {
    pub content_type: String,
    pub routine: Box<dyn Routine>,
}

fn thread_name() -> String {
    std::thread::current().name().unwrap_or("?").to_string()
}

/// Sleep `delay` seconds, then return the sum of `args`
pub enum Calculator {
    Start { args: Vec<i64>, delay: f64 },
    Computing { sum: i64 },
}

impl Calculator {
    pub fn new(args: Vec<i64>, delay: f64) -> Self {
        Self::Start { args, delay }
    }
}

impl Routine for Calculator {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        match self {
            Self::Start { args, delay } => {
                reel::info!("calculator executing in {}", thread_name());
                reel::info!("computing...");
                let delay = *delay;
                let sum = args.iter().sum();
                *self = Self::Computing { sum };
                reel::sleep_secs(delay).into()
            }
            Self::Computing { sum } => match input.into_value() {
                Ok(_) => {
                    reel::info!("finished computing...");
                    Step::ret(*sum)
                }
                Err(e) => Step::Raise(e),
            },
        }
    }

    fn name(&self) -> &str {
        "calculator"
    }
}

/// Builds the whole message, then returns it
pub enum Handler {
    Start { delay: f64 },
    Sleeping { message: String, delay: f64 },
    Computing { message: String },
    Done,
}

impl Routine for Handler {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        let input = match input.into_value() {
            Ok(x) => x,
            Err(e) => return Step::Raise(e),
        };
        match std::mem::replace(self, Self::Done) {
            Self::Start { delay } => {
                reel::info!("handler executing in {}", thread_name());
                *self = Self::Sleeping {
                    message: "hello world\n".to_string(),
                    delay,
                };
                reel::sleep_secs(delay).into()
            }
            Self::Sleeping { mut message, delay } => {
                message.push_str(&format!("timeout: {input}\n"));
                *self = Self::Computing { message };
                reel::delegate(Calculator::new(vec![2, 2], delay)).into()
            }
            Self::Computing { mut message } => {
                message.push_str(&format!("result: {input}\n"));
                Step::ret(message)
            }
            Self::Done => Step::ret(()),
        }
    }

    fn name(&self) -> &str {
        "handler"
    }
}

/// Emits every line as soon as it's known
pub enum HandlerPartial {
    Start { delay: f64 },
    Greeted { delay: f64 },
    Sleeping { delay: f64 },
    Reported { delay: f64 },
    Computing,
    Done,
}

impl Routine for HandlerPartial {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        let input = match input.into_value() {
            Ok(x) => x,
            Err(e) => return Step::Raise(e),
        };
        match std::mem::replace(self, Self::Done) {
            Self::Start { delay } => {
                *self = Self::Greeted { delay };
                Step::emit("hello world\n")
            }
            Self::Greeted { delay } => {
                *self = Self::Sleeping { delay };
                reel::sleep_secs(delay).into()
            }
            Self::Sleeping { delay } => {
                *self = Self::Reported { delay };
                Step::emit(format!("timeout: {input}\n"))
            }
            Self::Reported { delay } => {
                *self = Self::Computing;
                reel::delegate(Calculator::new(vec![2, 2], delay)).into()
            }
            Self::Computing => Step::emit(format!("result: {input}\n")),
            Self::Done => Step::ret(()),
        }
    }

    fn name(&self) -> &str {
        "handler_partial"
    }
}

/// Header, "before", the unit of work, "after"
struct Framed {
    step: u8,
    unit: Option<(AsyncUnit, Ensure)>,
}

impl Routine for Framed {
    fn resume(&mut self, _: &mut Context<'_>, input: Resume) -> Step {
        if let Resume::Error(e) = input {
            return Step::Raise(e);
        }
        self.step += 1;
        match self.step {
            1 => reel::emit_header(),
            2 => Step::emit("before\n"),
            3 => match self.unit.take() {
                Some((unit, options)) => reel::ensure_async(unit, options).into(),
                None => Step::ret(()),
            },
            4 => Step::emit("after\n"),
            _ => Step::ret(()),
        }
    }

    fn name(&self) -> &str {
        "framed"
    }
}

/// `/async/hello`: the handler's output between "before" and "after"
pub fn hello(partial: bool, delay: f64) -> Route {
    let unit = if partial {
        AsyncUnit::routine(HandlerPartial::Start { delay })
    } else {
        AsyncUnit::routine(Handler::Start { delay })
    };
    Route {
        content_type: "text/plain".to_string(),
        routine: Box::new(Framed {
            step: 0,
            unit: Some((unit, Ensure::partial(partial))),
        }),
    }
}

/// `/async/callable`: a blocking sleep on the worker pool between "before" and "after"
pub fn callable(seconds: f64) -> reel::Result<Route> {
    let duration = to_duration(seconds)?;
    let unit = AsyncUnit::callable(move |cx| {
        reel::info!("sleeping {seconds}s on '{}'", cx.worker);
        std::thread::sleep(duration);
        Ok(Value::Unit)
    });
    Ok(Route {
        content_type: "text/plain".to_string(),
        routine: Box::new(Framed {
            step: 0,
            unit: Some((unit, Ensure::default())),
        }),
    })
}

/// `/async/file`: the file, read in chunks
pub fn file(path: PathBuf, delay: f64, thread: bool) -> reel::Result<Route> {
    let delay = to_duration(delay)?;
    let content_type = guess_content_type(&path).to_string();
    Ok(Route {
        content_type,
        routine: Box::new(ServeFile {
            path: Some(path),
            delay,
            thread,
        }),
    })
}

struct ServeFile {
    path: Option<PathBuf>,
    delay: Duration,
    thread: bool,
}

impl Routine for ServeFile {
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step {
        if let Resume::Error(e) = input {
            return Step::Raise(e);
        }
        if let Resume::Start = input {
            return reel::emit_header();
        }
        match self.path.take() {
            Some(path) => {
                let chunks = reel::fs::read_chunks(path, cx.config().chunk_size, self.delay);
                let options = Ensure::partial(true).on_thread(self.thread);
                reel::ensure_async(AsyncUnit::routine(chunks), options).into()
            }
            None => Step::ret(()),
        }
    }

    fn name(&self) -> &str {
        "serve_file"
    }
}

/// `/async/http`: sleep, then proxy the url
pub fn http(url: String, delay: f64) -> Route {
    let mut step = 0;
    let mut url = Some(url);
    let routine = reel::routine_fn("http", move |_, input| {
        if let Resume::Error(e) = input {
            return Step::Raise(e);
        }
        step += 1;
        match step {
            1 => reel::emit_header(),
            2 => reel::sleep_secs(delay).into(),
            _ => match url.take() {
                Some(url) => reel::network_request(url, true).into(),
                None => Step::ret(()),
            },
        }
    });
    Route {
        content_type: "text/html".to_string(),
        routine: Box::new(routine),
    }
}

fn to_duration(seconds: f64) -> reel::Result<Duration> {
    reel::check!(
        reel::secs_to_duration(seconds),
        "invalid duration: {seconds} seconds"
    )
}

/// Guess the content type from the file extension
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "txt" | "log" => "text/plain",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Pull the stream to the end, writing the body to `out`.
///
/// With `json`, each data chunk is written as one JSON line instead.
/// Returns the number of body bytes written. A failure in the stream means
/// the response is truncated, and is returned as an error.
pub fn serve(stream: Stream, content_type: &str, mut out: impl Write, json: bool) -> reel::Result<usize> {
    let mut bytes = 0;
    for item in stream {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                return Err(e).context(format!("response truncated after {bytes} byte(s)"));
            }
        };
        match chunk {
            Chunk::Header => {
                reel::info!("flushing headers, content type: {content_type}");
                out.flush()?;
            }
            Chunk::Data(value) => {
                if json {
                    serde_json::to_writer(&mut out, &value)?;
                    out.write_all(b"\n")?;
                } else {
                    let data = value.to_bytes();
                    out.write_all(&data)?;
                    bytes += data.len();
                }
                out.flush()?;
            }
        }
    }
    reel::debug!("response complete, {bytes} byte(s)");
    Ok(bytes)
}
