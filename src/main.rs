//! ring-echo: a per-core sharded TCP echo server
//!
//! Every core runs an independent shard:
//! - its own SO_REUSEPORT listener on the shared port
//! - its own io_uring instance driving accept/recv/send
//! - a descriptor-indexed slot table and buffer arena
//!
//! Whatever bytes a client sends are sent straight back. SIGINT or SIGTERM
//! stops every shard within one bounded wait.

mod config;
mod runtime;

use config::Config;
use runtime::StopFlag;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = runtime::install_signal_handlers() {
        warn!(error = %e, "Failed to install signal handlers");
    }

    info!(
        host = %config.host,
        port = config.port,
        shards = config.shards,
        queue_depth = config.queue_depth,
        max_fds = config.max_fds,
        max_message_len = config.max_message_len,
        "Starting ring-echo server"
    );

    match runtime::run(config, StopFlag::process()) {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            std::process::exit(e.exit_code());
        }
    }
}
