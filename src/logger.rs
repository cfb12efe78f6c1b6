//! Centralized logging configuration for the planner binaries and benches
//!
//! This module provides a consistent logging setup with custom formatting
//! and default INFO level across all executables.

use tracing::Level;

/// Initialize the tracing subscriber with the planner's standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// # Example
/// ```no_run
/// use gpmp_planner::init_logger;
///
/// init_logger();
/// tracing::info!("Planner started");
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin arm_replanning
/// RUST_LOG=gpmp_planner::incremental=trace cargo run --bin arm_replanning
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// # Arguments
/// * `default_level` - Level used for every target RUST_LOG does not name
///
/// Calling this more than once is harmless; later calls keep the first subscriber.
///
/// # Example
/// ```no_run
/// use gpmp_planner::init_logger_with_level;
/// use tracing::Level;
///
/// // Per-iteration optimizer and Bayes tree messages are logged at DEBUG
/// init_logger_with_level(Level::DEBUG);
/// tracing::debug!("Replanning session started");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}
