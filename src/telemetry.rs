//! Tracing setup.
//!
//! Two sinks: human-readable lines on stderr (warnings only unless `--verbose`
//! or `RUST_LOG` says otherwise) and, when a log directory is given, a daily
//! rolling JSON log under `.colloquy/logs/` at debug level.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "colloquy";

/// Keeps the file writer flushing. Drop it at the end of `main`.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Directive used for stderr when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "colloquy=debug" } else { "colloquy=warn" }
}

fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> TelemetryGuard {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter(verbose));

    let mut file_error = None;
    let (file_layer, guard) = match log_dir.map(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(dir)
    }) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("colloquy=debug"));
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            file_error = Some(e.to_string());
            (None, None)
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some(error) = file_error {
        tracing::warn!(error = %error, "file logging disabled");
    }
    if installed {
        tracing::debug!(verbose, "tracing initialized");
    }

    TelemetryGuard { _file: guard }
}
