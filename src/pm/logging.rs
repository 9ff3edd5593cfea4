use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PIDMASTER_LOG";

/// Operator diagnostics on stderr. Stdout stays clean for `status --format json`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
