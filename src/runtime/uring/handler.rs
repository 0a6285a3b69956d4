//! Echo state machine driven by completions.
//!
//! Every descriptor has at most one operation outstanding. The listener
//! cycles through accepts forever; a connection alternates between a
//! receive and the send that echoes those bytes back, until a receive or
//! send fails and the connection is closed.

use crate::runtime::{OpKind, SlotState, SlotTable, Token};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// A drained completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
}

/// Operations the state machine issues against its shard's ring.
///
/// `prepare_*` calls only enqueue; nothing reaches the kernel until the
/// event loop submits.
pub trait Operations {
    /// Queue an accept on the listener.
    fn prepare_accept(&mut self) -> io::Result<()>;

    /// Queue a receive of up to `max_len` bytes into `fd`'s buffer slice,
    /// recording `AwaitingRead` in its slot.
    fn prepare_receive(&mut self, fd: RawFd, max_len: usize) -> io::Result<()>;

    /// Queue a send of `buf[sent..len]` from `fd`'s buffer slice,
    /// recording `AwaitingWrite` in its slot.
    fn prepare_send(&mut self, fd: RawFd, sent: u32, len: u32) -> io::Result<()>;

    /// Shut down and close an admitted connection, retiring its slot.
    fn close_connection(&mut self, fd: RawFd);

    /// Close a descriptor that was never admitted.
    fn reject(&mut self, fd: RawFd);

    fn slots(&self) -> &SlotTable;

    fn listener_fd(&self) -> RawFd;

    /// The accept in flight has completed.
    fn accept_completed(&mut self);

    /// The bounded-wait timer has completed.
    fn timer_fired(&mut self);
}

/// What a single completion did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// New connection admitted and awaiting its first read.
    Accepted { fd: RawFd },
    /// New connection at or above the descriptor ceiling, closed at once.
    Rejected { fd: RawFd },
    /// Accept failed with the given errno; another accept was queued.
    AcceptFailed { errno: i32 },
    /// Read `len` bytes; echo send queued.
    Echoing { fd: RawFd, len: u32 },
    /// Short send; the remainder was queued.
    SendingRest { fd: RawFd, sent: u32, len: u32 },
    /// Echo finished; next receive queued.
    Rearmed { fd: RawFd },
    /// Connection closed.
    Closed { fd: RawFd },
    TimerFired,
    /// Completion did not match any outstanding operation.
    Discarded,
}

/// Per-shard counters, reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub accepted: u64,
    pub rejected: u64,
    pub accept_failures: u64,
    pub closed: u64,
    pub bytes_echoed: u64,
    pub discarded: u64,
}

/// Interprets completions and issues each descriptor's next operation.
pub struct EchoProtocol {
    max_message_len: usize,
    stats: ShardStats,
}

impl EchoProtocol {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len,
            stats: ShardStats::default(),
        }
    }

    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Handle one completion.
    ///
    /// Errors are returned only when the listener could not be re-armed;
    /// connection failures close that connection and return `Ok`.
    pub fn dispatch<O: Operations>(
        &mut self,
        ops: &mut O,
        completion: Completion,
    ) -> io::Result<Transition> {
        let token = match Token::from_user_data(completion.user_data) {
            Some(token) => token,
            None => {
                debug!(user_data = completion.user_data, "Unknown token in completion");
                self.stats.discarded += 1;
                return Ok(Transition::Discarded);
            }
        };

        match token.kind {
            OpKind::Accept if token.fd == ops.listener_fd() => {
                self.on_accept(ops, completion.result)
            }
            OpKind::Timer => {
                ops.timer_fired();
                Ok(Transition::TimerFired)
            }
            OpKind::Read | OpKind::Write => {
                let state = ops.slots().lookup(token.fd);
                match state {
                    Some(pending) if pending.kind() == Some(token.kind) => match pending {
                        SlotState::AwaitingWrite { sent, len } => {
                            Ok(self.on_write(ops, token.fd, sent, len, completion.result))
                        }
                        _ => Ok(self.on_read(ops, token.fd, completion.result)),
                    },
                    _ => {
                        debug!(fd = token.fd, kind = ?token.kind, ?state, "Stale completion");
                        self.stats.discarded += 1;
                        Ok(Transition::Discarded)
                    }
                }
            }
            OpKind::Accept => {
                debug!(fd = token.fd, "Accept completion for foreign listener");
                self.stats.discarded += 1;
                Ok(Transition::Discarded)
            }
        }
    }

    fn on_accept<O: Operations>(&mut self, ops: &mut O, result: i32) -> io::Result<Transition> {
        ops.accept_completed();

        let transition = if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            warn!("Accept failed: {}", err);
            self.stats.accept_failures += 1;
            Transition::AcceptFailed { errno: -result }
        } else {
            let fd = result;
            if !ops.slots().admits(fd) {
                warn!(fd, ceiling = ops.slots().ceiling(), "Descriptor over ceiling, closing");
                ops.reject(fd);
                self.stats.rejected += 1;
                Transition::Rejected { fd }
            } else {
                self.stats.accepted += 1;
                debug!(fd, "Accepted connection");
                match ops.prepare_receive(fd, self.max_message_len) {
                    Ok(()) => Transition::Accepted { fd },
                    Err(e) => {
                        debug!(fd, "Failed to queue first read: {}", e);
                        self.close(ops, fd)
                    }
                }
            }
        };

        // The listener must never go idle, whatever happened above
        ops.prepare_accept()?;

        Ok(transition)
    }

    fn on_read<O: Operations>(&mut self, ops: &mut O, fd: RawFd, result: i32) -> Transition {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, "Read error: {}", err);
            } else {
                debug!(fd, "Connection closed by peer");
            }
            return self.close(ops, fd);
        }

        let len = result as u32;
        match ops.prepare_send(fd, 0, len) {
            Ok(()) => Transition::Echoing { fd, len },
            Err(e) => {
                debug!(fd, "Failed to queue echo: {}", e);
                self.close(ops, fd)
            }
        }
    }

    fn on_write<O: Operations>(
        &mut self,
        ops: &mut O,
        fd: RawFd,
        sent: u32,
        len: u32,
        result: i32,
    ) -> Transition {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, "Write error: {}", err);
            }
            return self.close(ops, fd);
        }

        let written = result as u32;
        self.stats.bytes_echoed += written as u64;
        let sent = sent.saturating_add(written).min(len);

        if sent < len {
            // Partial write, send the rest from the same slice
            return match ops.prepare_send(fd, sent, len) {
                Ok(()) => Transition::SendingRest { fd, sent, len },
                Err(e) => {
                    debug!(fd, "Failed to queue remainder: {}", e);
                    self.close(ops, fd)
                }
            };
        }

        match ops.prepare_receive(fd, self.max_message_len) {
            Ok(()) => Transition::Rearmed { fd },
            Err(e) => {
                debug!(fd, "Failed to queue read: {}", e);
                self.close(ops, fd)
            }
        }
    }

    fn close<O: Operations>(&mut self, ops: &mut O, fd: RawFd) -> Transition {
        ops.close_connection(fd);
        self.stats.closed += 1;
        debug!(fd, "Connection closed");
        Transition::Closed { fd }
    }
}
