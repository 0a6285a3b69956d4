//! Cooperative shutdown flag shared by every shard.
//!
//! The flag only ever moves from false to true, so relaxed loads and stores
//! are enough: a shard that misses the store on one iteration sees it on the
//! next, and each iteration is bounded by the ring's wait timeout.

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide flag set by SIGINT/SIGTERM.
static PROCESS_STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    PROCESS_STOP.store(true, Ordering::Relaxed);
}

/// Route SIGINT and SIGTERM to the process-wide stop flag.
pub fn install_signal_handlers() -> std::io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        let prev = unsafe { libc::signal(signo, on_signal as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read-mostly handle to a stop flag.
#[derive(Debug, Clone, Copy)]
pub struct StopFlag(&'static AtomicBool);

impl StopFlag {
    /// The flag driven by process signals.
    pub fn process() -> Self {
        Self(&PROCESS_STOP)
    }

    /// A fresh flag independent of signals.
    ///
    /// The backing atomic is leaked; create these once per server.
    #[allow(dead_code)] // used by embedding code and tests
    pub fn detached() -> Self {
        Self(Box::leak(Box::new(AtomicBool::new(false))))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
