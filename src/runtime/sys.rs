//! Thin wrappers over the few raw syscalls the runtime needs.

use std::io;
use std::os::unix::io::RawFd;

/// Pin the calling thread to `core`.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Raise the open-file soft limit to at least `wanted`.
///
/// Never lowers an existing limit. If the hard limit is below `wanted` an
/// increase is attempted; when that is refused the soft limit is raised as
/// far as the hard limit allows and an error is still returned.
/// Returns the soft limit now in effect.
pub fn raise_fd_limit(wanted: u64) -> io::Result<u64> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let wanted = wanted as libc::rlim_t;
    if rl.rlim_cur >= wanted {
        return Ok(rl.rlim_cur as u64);
    }

    if rl.rlim_max >= wanted {
        rl.rlim_cur = wanted;
        return set_nofile(&rl).map(|()| wanted as u64);
    }

    let raised = libc::rlimit {
        rlim_cur: wanted,
        rlim_max: wanted,
    };
    match set_nofile(&raised) {
        Ok(()) => Ok(wanted as u64),
        Err(e) => {
            rl.rlim_cur = rl.rlim_max;
            let _ = set_nofile(&rl);
            Err(e)
        }
    }
}

fn set_nofile(rl: &libc::rlimit) -> io::Result<()> {
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shut down both directions of a connected socket and close it.
pub fn shutdown_and_close(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
}

/// Close a descriptor without shutting it down first.
pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}
