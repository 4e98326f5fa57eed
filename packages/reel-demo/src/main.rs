//! Serve one of the example routes to stdout
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Parser, Subcommand};
use reel::pre::*;

mod app;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Red.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Debug, Parser)]
#[clap(version, styles = STYLES)]
struct Cli {
    #[clap(subcommand)]
    route: Route,
    #[clap(flatten)]
    flags: Flags,
    /// Driver configuration file (TOML). Environment variables are used if not set
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Write every data chunk as one JSON line, instead of the raw body
    #[clap(long, global = true)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, clap::Args)]
struct Flags {
    /// Verbose. More -v makes it more verbose (opposite of --quiet)
    #[clap(short = 'v', long, global = true, action(clap::ArgAction::Count))]
    verbose: u8,
    /// Quiet. More -q makes it more quiet (opposite of --verbose)
    #[clap(short = 'q', long, global = true, action(clap::ArgAction::Count))]
    quiet: u8,
}

impl Flags {
    /// The default log filter for the verbose level
    fn filter(&self) -> &'static str {
        let level = self.verbose.clamp(0, 2) as i8 - self.quiet.clamp(0, 2) as i8;
        match level {
            ..-1 => "off",
            -1 => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Route {
    /// Greeting with a sleep and a computation, between "before" and "after"
    Hello {
        /// Forward lines as they are produced, instead of the whole message at the end
        #[clap(long, default_value_t = true, action(clap::ArgAction::Set))]
        partial: bool,
        /// Seconds to sleep, both in the handler and the calculator
        #[clap(long, default_value_t = 3.0, allow_negative_numbers = true)]
        delay: f64,
    },
    /// Blocking sleep on the worker pool, between "before" and "after"
    Callable {
        #[clap(long, default_value_t = 30.0)]
        seconds: f64,
    },
    /// Stream a file in chunks
    File {
        path: PathBuf,
        /// Seconds to sleep before each chunk
        #[clap(long, default_value_t = 0.0)]
        delay: f64,
        /// Read the file on a worker thread
        #[clap(long)]
        thread: bool,
    },
    /// Proxy a url
    Http {
        #[clap(long, default_value = "https://www.flickr.com/")]
        url: String,
        /// Seconds to sleep before the request
        #[clap(long, default_value_t = 0.0)]
        delay: f64,
    },
}

fn main() -> ExitCode {
    let start = Instant::now();
    let cli = Cli::parse();
    reel::log_init(cli.flags.filter());
    let result = run(cli);
    let elapsed = start.elapsed().as_secs_f32();
    match result {
        Ok(()) => {
            reel::debug!("finished in {elapsed:.2}s");
            ExitCode::SUCCESS
        }
        Err(e) => {
            reel::error!("fatal: {e:?}");
            reel::info!("failed in {elapsed:.2}s");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> reel::Result<()> {
    let config = match &cli.config {
        Some(path) => reel::Config::load(path)?,
        None => reel::Config::from_env()?,
    };
    reel::debug!("config: {config:?}");
    let driver = reel::Driver::new(config)?;
    let route = match cli.route {
        Route::Hello { partial, delay } => app::hello(partial, delay),
        Route::Callable { seconds } => app::callable(seconds)?,
        Route::File {
            path,
            delay,
            thread,
        } => app::file(path, delay, thread)?,
        Route::Http { url, delay } => app::http(url, delay),
    };
    let stream = driver.stream_boxed(route.routine);
    let mut stdout = std::io::stdout().lock();
    let result = app::serve(stream, &route.content_type, &mut stdout, cli.json);
    driver.shutdown();
    let bytes = result?;
    stdout.flush().context("failed to flush stdout")?;
    reel::debug!("served {bytes} byte(s)");
    Ok(())
}
