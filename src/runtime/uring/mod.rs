//! Linux io_uring backend.
//!
//! Completion-based I/O with one ring per shard and batched completion
//! handling.

mod event_loop;
mod handler;
mod ring;
mod server;

pub use event_loop::ShardOutcome;
pub use server::{Server, ShardReport};

use crate::config::Config;
use crate::runtime::{StartupError, StopFlag};
use tracing::{debug, info};

/// Start every shard, then wait for them to stop.
pub fn run(config: Config, stop: StopFlag) -> Result<(), StartupError> {
    let server = Server::start(&config, stop)?;

    info!(
        addr = %server.local_addr(),
        shards = server.shard_count(),
        "Server listening"
    );

    summarize(server.join())
}

/// Log what every shard did and total their counters.
///
/// Individual failures were already logged by the shard or at join time.
/// The run only counts as failed when no shard stopped cleanly.
fn summarize(reports: Vec<ShardReport>) -> Result<(), StartupError> {
    let shards = reports.len();
    let mut accepted = 0;
    let mut bytes_echoed = 0;
    let mut failed = 0;
    let mut last_error = None;

    for report in reports {
        let stats = match report.outcome {
            ShardOutcome::Stopped(stats) => Some(stats),
            ShardOutcome::Failed(stats, e) => {
                failed += 1;
                last_error = Some(e);
                Some(stats)
            }
            ShardOutcome::NeverStarted | ShardOutcome::Panicked => {
                failed += 1;
                None
            }
        };

        if let Some(stats) = stats {
            debug!(
                shard = report.id,
                core = report.core,
                addr = ?report.local_addr,
                accepted = stats.accepted,
                rejected = stats.rejected,
                bytes_echoed = stats.bytes_echoed,
                "Shard summary"
            );
            accepted += stats.accepted;
            bytes_echoed += stats.bytes_echoed;
        }
    }

    info!(
        shards,
        failed,
        accepted,
        bytes_echoed,
        "All shards stopped"
    );

    if shards > 0 && failed == shards {
        return Err(StartupError::ShardsFailed(last_error));
    }
    Ok(())
}
