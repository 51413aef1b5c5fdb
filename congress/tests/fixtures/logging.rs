//! Tracing setup for the integration suite.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for a unit test, once per process.
///
/// The guard of the non-blocking writer lives for the whole process so logs
/// are flushed when it exits.
pub fn init_default_ut_tracing() {
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();
    GUARD.get_or_init(|| init_file_tracing("ut", "_log", "DEBUG"));
}

/// Initialize a global tracing subscriber writing to rolling files in `dir`.
///
/// `RUST_LOG` overrides `level` when set.
pub fn init_file_tracing(app_name: &str, dir: &str, level: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(dir, format!("{}.log", app_name));
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("error setting global tracing subscriber");

    tracing::info!("initialized global tracing for {}", app_name);
    guard
}
