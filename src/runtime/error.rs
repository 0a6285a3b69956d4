//! Server errors and the process exit status each maps to.

use crate::config::ConfigError;

/// Errors that prevent the server from coming up or keep it from serving.
#[derive(Debug)]
pub enum StartupError {
    /// The listen address could not be resolved.
    Config(ConfigError),
    /// A shard's slot table or buffer arena could not be allocated.
    Alloc(std::io::Error),
    /// A shard thread could not be spawned.
    Spawn(std::io::Error),
    /// Every shard failed to bind its listener or create its ring.
    NoShards,
    /// Every shard that started ended in failure; holds the last loop error.
    ShardsFailed(Option<std::io::Error>),
    /// No completion-based backend on this platform.
    #[allow(dead_code)] // only constructed off Linux
    Unsupported,
}

impl StartupError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) | StartupError::Unsupported => 1,
            StartupError::Alloc(_) => 2,
            StartupError::Spawn(_) => 3,
            StartupError::NoShards => 4,
            StartupError::ShardsFailed(_) => 5,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Alloc(e) => write!(f, "Failed to allocate shard memory: {e}"),
            StartupError::Spawn(e) => write!(f, "Failed to spawn shard thread: {e}"),
            StartupError::NoShards => write!(f, "No shard could be started"),
            StartupError::ShardsFailed(Some(e)) => write!(f, "Every shard failed: {e}"),
            StartupError::ShardsFailed(None) => write!(f, "Every shard failed"),
            StartupError::Unsupported => {
                write!(f, "Unsupported platform: only Linux io_uring is supported")
            }
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Alloc(e)
            | StartupError::Spawn(e)
            | StartupError::ShardsFailed(Some(e)) => Some(e),
            StartupError::ShardsFailed(None)
            | StartupError::NoShards
            | StartupError::Unsupported => None,
        }
    }
}
