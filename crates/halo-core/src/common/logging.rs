//! Logging helpers layered over `tracing`.

use tracing::level_filters::LevelFilter;

/// Runs `operation` with messages below ERROR suppressed on the current thread.
pub fn quiet<T>(operation: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, operation)
}
