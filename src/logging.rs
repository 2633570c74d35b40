//! Logging initialisation for pg-vm.
//!
//! Bring-up progress is logged under the `bringup` target and guest console
//! output under `bringup::console`. With `verbose` the default filter is
//! `info`, otherwise `warn`; `RUST_LOG` overrides both.
//!
//! When the `PGVM_LOG` environment variable is set to `1`, logs are also
//! written to `pg-vm.log` in the log directory.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "pg-vm.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose { "info" } else { "warn" }
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> LogGuard {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)))
    };

    let file_guard = if std::env::var("PGVM_LOG").as_deref() == Ok("1") {
        let dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(fallback_log_dir);
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}

/// Used when no log directory could be resolved.
fn fallback_log_dir() -> PathBuf {
    std::env::temp_dir().join("pg-vm")
}
