use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Where log files for this process go: `<data dir>/msagent/logs`.
pub fn log_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("msagent").join("logs"))
}

/// Initialize the tracing system with a file logger that writes to a
/// timestamp-named file. The filter is read from the RUST_LOG environment
/// variable.
///
/// Returns the log file path, or `None` when logging went to stderr because no
/// data directory was available.
pub fn init_tracing() -> io::Result<Option<PathBuf>> {
    match log_dir() {
        Some(dir) => init_file_tracing(&dir).map(Some),
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    fmt::Layer::default()
                        .with_writer(io::stderr)
                        .with_ansi(true)
                        .with_target(true),
                )
                .with(EnvFilter::from_default_env());
            tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

            tracing::debug!(
                target: "msagent::utils::tracing",
                "Tracing initialized with stderr output. Filter configured via RUST_LOG env var."
            );
            Ok(None)
        }
    }
}

fn init_file_tracing(log_dir: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;

    let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
    let path = log_dir.join(&file_name);
    let file_appender = rolling::never(log_dir, file_name);

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env());

    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

    tracing::debug!(
        target: "msagent::utils::tracing",
        path = %path.display(),
        "Tracing initialized with file output. Filter configured via RUST_LOG env var."
    );
    Ok(path)
}
