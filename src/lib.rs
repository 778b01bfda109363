pub mod config;
pub mod context; // Per-run state handed to every stage
pub mod pipeline;
pub mod serve; // Static file server for run directories

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr so stdout stays
/// usable for command output. Safe to call more than once.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(config::ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    tracing::debug!("{} v{} logging initialised", config::APP_NAME, config::APP_VERSION);
}
