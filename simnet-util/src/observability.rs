use std::error::Error;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/** map a `-v` count to the default level: info, then debug, then trace */
pub fn verbosity_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/** create a non blocking tracing file appender writing `<who>.log` in `logdir` */
pub fn setup_file_appender<P: AsRef<Path>>(logdir: P, who: &str) -> (NonBlocking, WorkerGuard) {
    let file_appender = rolling::never(logdir.as_ref(), format!("{}.log", who));

    tracing_appender::non_blocking(file_appender)
}

/** create a RUST_LOG env based log filter, falling back to `level` */
pub fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder().with_default_directive(level.into()).from_env_lossy()
}

/**
 * Initialize tracing-subscriber with env filter based on RUST_LOG env variable.
 * fmt layer is used to print logs to stderr, so stdout carries only the summary.
 * An optional fmt layer with a file writer logs to `<who>.log` in `logdir`.
 * Records emitted through the `log` crate are forwarded.
*/
pub fn init_tracing_subscriber<P: AsRef<Path>>(
    logdir: Option<P>,
    who: &str,
    verbose: u8,
) -> Result<LogGuard, Box<dyn Error>> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .with_target(false)
        .with_source_location(verbose > 0)
        .compact();

    let stderr_layer = fmt::layer().event_format(format.clone()).with_writer(std::io::stderr);
    let (file_layer, file_guard) = match logdir {
        Some(dir) => {
            let (file_writer, guard) = setup_file_appender(dir, who);
            let layer = fmt::layer().event_format(format.with_ansi(false)).with_writer(file_writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(env_filter(verbosity_level(verbose)));

    match subscriber.try_init() {
        Ok(_) => Ok(LogGuard::new(file_guard)),
        Err(err) => Err(Box::new(err)),
    }
}

/// Flushes the file appender when dropped; hold it for the life of the process
pub struct LogGuard {
    _file_appender_guard: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn new(file_appender_guard: Option<WorkerGuard>) -> Self {
        Self { _file_appender_guard: file_appender_guard }
    }
}
