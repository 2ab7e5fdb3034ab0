//! tracing-subscriber setup: console layer on stderr, optional JSON file layer.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. The returned guard flushes the file layer
/// when dropped, so keep it alive until the process is about to exit.
pub fn init(level: &str, json: bool, logging: &vent_config::Logging) -> eyre::Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| eyre::eyre!("invalid log level '{level}': {e}"))?,
    };

    let console = if json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match logging.file.as_deref() {
        Some(path) => {
            let appender = rolling_appender(Path::new(path), logging.rotation.as_deref())?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| eyre::eyre!("logging already initialized: {e}"))?;
    Ok(guard)
}

fn rolling_appender(
    path: &Path,
    rotation: Option<&str>,
) -> eyre::Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let Some(name) = path.file_name() else {
        eyre::bail!("logging.file {path:?} has no file name");
    };
    Ok(match rotation.unwrap_or("never") {
        "daily" => tracing_appender::rolling::daily(dir, name),
        "hourly" => tracing_appender::rolling::hourly(dir, name),
        "never" => tracing_appender::rolling::never(dir, name),
        other => eyre::bail!("logging.rotation must be never, daily or hourly (got {other})"),
    })
}
