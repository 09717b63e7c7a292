use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "json_fanout.log";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("json_fanout=debug,warn")
        } else {
            EnvFilter::new("json_fanout=info,warn")
        }
    })
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// With a log directory, output goes to a daily rolling file through a
/// non-blocking writer; keep the returned guard alive until exit or the
/// tail of the log is lost. Without one, logs go to stderr so stdout stays
/// free for dispatched records.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let filter = default_filter(verbose);

    match log_dir {
        Some(dir) => {
            let file_appender = rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false) // no color codes in file
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
