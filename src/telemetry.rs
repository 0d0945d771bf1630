//! Tracing initialization for the control process and the worker processes.

use std::io;
use tracing_subscriber::EnvFilter;

/// Initializes structured logging for the control process.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

/// Initializes logging for a worker process.
///
/// Workers speak the line protocol on stdout, so their logs must go to
/// stderr. The worker id ends up in each line through the process's span.
pub fn init_worker() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
