//! Telemetry helpers for structured logging and tracing.

/// Install a default fmt subscriber if none is set.
///
/// The filter comes from `RUST_LOG`; when that is unset or invalid,
/// `default_directive` (for example `"prometheus_resource_core=info"`) is used.
pub fn init_tracing(default_directive: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
