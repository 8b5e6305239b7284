//! Tracing setup for the CLI.
//!
//! Human-readable events go to stderr so stdout stays clean for plans and
//! outputs. With `log.dir` set, a daily-rolling file gets the same events,
//! as JSON lines when `log.json` is on.

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "clusterform.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init();
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
    guard
}
