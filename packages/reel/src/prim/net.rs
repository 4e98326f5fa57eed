use std::io::Read as _;
use std::sync::{Arc, Mutex};

use reqwest::blocking::Response;

use crate::{Context, ErrorContext as _, Forward, Resume, Routine, Step, Suspension, Target, Value};

/// Perform an HTTP GET without blocking the driver thread.
///
/// The request runs on the worker pool. With `partial`, the body is
/// forwarded in chunks of `chunk_size` bytes (see [`Config`](crate::Config))
/// as it is received, and the routine resumes with the total number of bytes.
/// Otherwise, the whole body is emitted as one chunk and the routine resumes with it.
///
/// Connection failures and HTTP error statuses are raised.
pub fn network_request(url: impl Into<String>, partial: bool) -> Suspension {
    Suspension::Delegate {
        target: Target::Routine(Box::new(Request {
            url: url.into(),
            partial,
            response: Arc::new(Mutex::new(None)),
            state: RequestState::Connect,
            total: 0,
        })),
        forward: Forward::Live,
    }
}

struct Request {
    url: String,
    partial: bool,
    /// The response being read in partial mode
    response: Arc<Mutex<Option<Response>>>,
    state: RequestState,
    total: usize,
}

enum RequestState {
    Connect,
    Connecting,
    Reading,
    Emitted(Value),
}

impl Routine for Request {
    fn resume(&mut self, cx: &mut Context<'_>, input: Resume) -> Step {
        let input = match input {
            Resume::Error(e) => return Step::Raise(e),
            x => x,
        };
        match std::mem::replace(&mut self.state, RequestState::Connecting) {
            RequestState::Connect => self.connect(),
            RequestState::Connecting => {
                let value = input.into_value().unwrap_or_default();
                if self.partial {
                    self.state = RequestState::Reading;
                    return self.read(cx.config().chunk_size);
                }
                self.state = RequestState::Emitted(value.clone());
                Step::emit(value)
            }
            RequestState::Reading => {
                self.state = RequestState::Reading;
                match input {
                    Resume::Value(Value::Bytes(bytes)) if bytes.is_empty() => {
                        crate::debug!("read {} byte(s) from '{}'", self.total, self.url);
                        Step::ret(self.total)
                    }
                    Resume::Value(value) => {
                        self.total += value.to_bytes().len();
                        Step::emit(value)
                    }
                    _ => self.read(cx.config().chunk_size),
                }
            }
            RequestState::Emitted(value) => Step::Return(value),
        }
    }

    fn name(&self) -> &str {
        "network_request"
    }
}

impl Request {
    fn connect(&mut self) -> Step {
        let url = self.url.clone();
        let partial = self.partial;
        let response = Arc::clone(&self.response);
        Suspension::Offload(Box::new(move |wcx| {
            crate::debug!("GET '{url}' on '{}'", wcx.worker);
            let r = crate::check!(reqwest::blocking::get(&url), "request to '{url}' failed")?;
            let r = crate::check!(r.error_for_status(), "request to '{url}' failed")?;
            if partial {
                *response.lock().unwrap_or_else(|e| e.into_inner()) = Some(r);
                return Ok(Value::Unit);
            }
            let body = crate::check!(r.bytes(), "failed to read response from '{url}'")?;
            Ok(Value::Bytes(body.to_vec()))
        }))
        .into()
    }

    fn read(&self, chunk_size: usize) -> Step {
        let url = self.url.clone();
        let response = Arc::clone(&self.response);
        Suspension::Offload(Box::new(move |_| {
            let mut response = response.lock().unwrap_or_else(|e| e.into_inner());
            let Some(r) = response.as_mut() else {
                crate::bail!("response from '{url}' is gone");
            };
            let mut buf = Vec::with_capacity(chunk_size);
            crate::check!(
                r.take(chunk_size as u64).read_to_end(&mut buf),
                "failed to read response from '{url}'"
            )?;
            if buf.is_empty() {
                // drop the connection as soon as the body is done
                *response = None;
            }
            Ok(Value::Bytes(buf))
        }))
        .into()
    }
}
