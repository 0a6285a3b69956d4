//! Per-shard io_uring context.
//!
//! Owns the ring and the shard's listening socket, and borrows the shard's
//! slot table and buffer arena for as long as the ring is alive. Every
//! pointer handed to the kernel refers to one of those, so none of them can
//! be released while an operation might still use it.

use super::handler::{Completion, Operations};
use crate::runtime::{sys, BufferPool, OpKind, SlotState, SlotTable, Token};
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

pub struct RingContext<'a> {
    ring: IoUring,
    listener: TcpListener,
    slots: &'a mut SlotTable,
    buffers: &'a mut BufferPool,
    /// Kernel negotiated IORING_FEAT_FAST_POLL.
    fast_poll: bool,
    /// Kernel accepts a timeout in io_uring_enter (IORING_FEAT_EXT_ARG).
    ext_arg: bool,
    /// Boxed so the address handed to a Timeout op stays put.
    wait_timeout: Box<types::Timespec>,
    timer_armed: bool,
    accepts_in_flight: usize,
    /// Reused storage for drained completions.
    ready: Vec<Completion>,
}

impl<'a> RingContext<'a> {
    pub fn new(
        queue_depth: u32,
        wait_timeout: Duration,
        listener: TcpListener,
        slots: &'a mut SlotTable,
        buffers: &'a mut BufferPool,
    ) -> io::Result<Self> {
        let ring: IoUring = IoUring::new(queue_depth)?;
        let params = ring.params();
        let fast_poll = params.is_feature_fast_poll();
        let ext_arg = params.is_feature_ext_arg();

        let wait_timeout = Box::new(
            types::Timespec::new()
                .sec(wait_timeout.as_secs())
                .nsec(wait_timeout.subsec_nanos()),
        );

        Ok(Self {
            ring,
            listener,
            slots,
            buffers,
            fast_poll,
            ext_arg,
            wait_timeout,
            timer_armed: false,
            accepts_in_flight: 0,
            ready: Vec::with_capacity(queue_depth as usize),
        })
    }

    pub fn has_fast_poll(&self) -> bool {
        self.fast_poll
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Flush queued operations to the kernel without waiting.
    pub fn submit(&mut self) -> io::Result<()> {
        match self.ring.submit() {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block until a completion is ready or the wait timeout elapses.
    ///
    /// Returns whether completions are available. Timeouts and interrupted
    /// waits are not errors; the caller simply loops and re-checks its
    /// stop condition.
    pub fn wait_for_completion(&mut self) -> io::Result<bool> {
        if self.ring.completion().is_empty() {
            let waited = if self.ext_arg {
                let args = types::SubmitArgs::new().timespec(&self.wait_timeout);
                self.ring.submitter().submit_with_args(1, &args)
            } else {
                self.arm_timer()?;
                self.ring.submit_and_wait(1)
            };

            match waited {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ETIME) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(!self.ring.completion().is_empty())
    }

    /// Take every completion currently available.
    ///
    /// Hand the batch back with [`RingContext::recycle`] to reuse its storage.
    pub fn drain_ready(&mut self) -> Vec<Completion> {
        let mut batch = std::mem::take(&mut self.ready);
        batch.extend(self.ring.completion().map(|cqe| Completion {
            user_data: cqe.user_data(),
            result: cqe.result(),
        }));
        batch
    }

    pub fn recycle(&mut self, mut batch: Vec<Completion>) {
        batch.clear();
        self.ready = batch;
    }

    /// Release the ring and listener, then close connections still open.
    ///
    /// Operations still in flight are abandoned along with the ring.
    /// Returns the number of connections closed.
    pub fn shutdown(self) -> usize {
        let RingContext {
            ring,
            listener,
            slots,
            ..
        } = self;
        drop(ring);
        drop(listener);

        let open = slots.retire_all();
        for &fd in &open {
            sys::shutdown_and_close(fd);
        }
        open.len()
    }

    fn arm_timer(&mut self) -> io::Result<()> {
        if self.timer_armed {
            return Ok(());
        }
        let entry = opcode::Timeout::new(&*self.wait_timeout as *const types::Timespec)
            .build()
            .user_data(Token::new(0, OpKind::Timer).to_user_data());
        self.push(&entry)?;
        self.timer_armed = true;
        Ok(())
    }

    fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        // SAFETY: entries only point into the listener, the buffer arena or
        // the boxed timespec, all of which outlive the ring.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        // Queue full: hand what we have to the kernel and try once more
        self.submit()?;
        unsafe {
            self.ring
                .submission()
                .push(entry)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
        }
    }

    fn buffer_ptr(&mut self, fd: RawFd) -> io::Result<*mut u8> {
        self.buffers.as_mut_ptr(fd).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} has no buffer slice"),
            )
        })
    }
}

impl Operations for RingContext<'_> {
    fn prepare_accept(&mut self) -> io::Result<()> {
        debug_assert_eq!(
            self.accepts_in_flight, 0,
            "listener already has an accept queued"
        );

        let fd = self.listener.as_raw_fd();
        let accept = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build()
            .user_data(Token::new(fd, OpKind::Accept).to_user_data());

        self.push(&accept)?;
        self.accepts_in_flight += 1;
        Ok(())
    }

    fn prepare_receive(&mut self, fd: RawFd, max_len: usize) -> io::Result<()> {
        let ptr = self.buffer_ptr(fd)?;
        let len = max_len.min(self.buffers.stride());

        let recv = opcode::Recv::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(Token::new(fd, OpKind::Read).to_user_data());

        self.push(&recv)?;
        self.slots
            .assign(fd, SlotState::AwaitingRead)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn prepare_send(&mut self, fd: RawFd, sent: u32, len: u32) -> io::Result<()> {
        if sent >= len || len as usize > self.buffers.stride() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid send range {sent}..{len}"),
            ));
        }
        let ptr = self.buffer_ptr(fd)?;

        // SAFETY: sent < len <= stride keeps the pointer inside fd's slice
        let send = opcode::Send::new(
            types::Fd(fd),
            unsafe { ptr.add(sent as usize) } as *const u8,
            len - sent,
        )
        .build()
        .user_data(Token::new(fd, OpKind::Write).to_user_data());

        self.push(&send)?;
        self.slots
            .assign(fd, SlotState::AwaitingWrite { sent, len })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn close_connection(&mut self, fd: RawFd) {
        self.slots.retire(fd);
        sys::shutdown_and_close(fd);
    }

    fn reject(&mut self, fd: RawFd) {
        sys::close(fd);
    }

    fn slots(&self) -> &SlotTable {
        &*self.slots
    }

    fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn accept_completed(&mut self) {
        self.accepts_in_flight = self.accepts_in_flight.saturating_sub(1);
    }

    fn timer_fired(&mut self) {
        self.timer_armed = false;
    }
}

/// Errors that only mean "try again".
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR | libc::EBUSY | libc::EAGAIN)
    )
}
