pub mod analyzer;
pub mod audit;
pub mod config;
pub mod core;
pub mod enrichment;
pub mod error;
pub mod interceptor;
pub mod ipc;
pub mod lookup;
pub mod supervisor;

use tracing_subscriber::EnvFilter;

/// Installs the shared panic hook and initializes structured logging.
/// Called once by each binary entry point before doing anything else —
/// grounded on the teacher's `lib.rs::run()`, which does the same for the
/// GUI process.
pub fn init_logging(default_filter: &str) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("panic in NetShield: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
