use std::io::Write as _;
use std::sync::OnceLock;

static LOG_FILTER: OnceLock<env_filter::Filter> = OnceLock::new();

/// Install a logger that prints to stderr.
///
/// The filter is read from `RUST_LOG` (same syntax as `env_logger`). If that's
/// not set, `default_filter` is used, for example `"info"` or `"pistonite_reel=debug"`.
/// Each line is prefixed with the level and the name of the thread that logged it,
/// which is how to tell the driver, timer and worker threads apart.
///
/// Only the first call has effect.
pub fn log_init(default_filter: &str) {
    let directives = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default_filter.to_string(),
    };
    let mut builder = env_filter::Builder::new();
    let filter = builder.parse(&directives).build();
    let log_level = filter.filter();
    if LOG_FILTER.set(filter).is_err() {
        return;
    }
    log::set_max_level(log_level);

    struct LogImpl;
    impl log::Log for LogImpl {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            LOG_FILTER.get().is_some_and(|filter| filter.enabled(metadata))
        }

        fn log(&self, record: &log::Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let thread = std::thread::current();
            let name = thread.name().unwrap_or("?");
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "[{:<5} {name}] {}", record.level(), record.args());
        }

        fn flush(&self) {
            let _ = std::io::stderr().flush();
        }
    }

    let _ = log::set_logger(&LogImpl);
}
