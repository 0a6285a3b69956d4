//! Sharded echo runtime.
//!
//! One independent shard per core, each with its own listener (sharing a
//! port through SO_REUSEPORT), io_uring instance, slot table and buffer
//! arena. Shards share nothing but the stop flag.
//!
//! Platform-neutral pieces:
//! - `SlotTable`: pending operation per descriptor
//! - `BufferPool`: fixed-stride buffer per descriptor
//! - `Token`: operation tagging for completion correlation
//! - `StopFlag`: cooperative shutdown

mod buffer;
mod error;
mod slots;
mod stop;
mod sys;
mod token;

pub(crate) use buffer::BufferPool;
pub use error::StartupError;
pub(crate) use slots::{SlotState, SlotTable};
pub use stop::{install_signal_handlers, StopFlag};
pub(crate) use token::{OpKind, Token};

#[cfg(target_os = "linux")]
mod uring;

use crate::config::Config;

/// Run the server until the stop flag is set.
pub fn run(config: Config, stop: StopFlag) -> Result<(), StartupError> {
    #[cfg(target_os = "linux")]
    {
        uring::run(config, stop)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (config, stop); // suppress unused warnings
        Err(StartupError::Unsupported)
    }
}
