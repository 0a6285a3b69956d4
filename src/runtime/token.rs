//! Operation tokens for io_uring completion correlation.
//!
//! Each submitted operation carries a token (user_data) naming the
//! descriptor it acts on and the kind of operation. The descriptor is an
//! index into the shard's slot table, never a pointer, so a late completion
//! can at worst be recognised as stale and dropped.

use std::os::unix::io::RawFd;

/// Kind of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    /// Accept on the shard's listening socket.
    Accept = 1,
    /// Receive into the descriptor's buffer slice.
    Read = 2,
    /// Send from the descriptor's buffer slice.
    Write = 3,
    /// Internal wake-up used to bound a completion wait.
    Timer = 4,
}

impl OpKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(OpKind::Accept),
            2 => Some(OpKind::Read),
            3 => Some(OpKind::Write),
            4 => Some(OpKind::Timer),
            _ => None,
        }
    }
}

/// A (descriptor, kind) pair packed into io_uring user data.
///
/// Layout: `kind << 32 | fd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub fd: RawFd,
    pub kind: OpKind,
}

impl Token {
    pub fn new(fd: RawFd, kind: OpKind) -> Self {
        Self { fd, kind }
    }

    pub fn to_user_data(self) -> u64 {
        ((self.kind as u64) << 32) | (self.fd as u32 as u64)
    }

    /// Returns `None` for user data this runtime never produced.
    pub fn from_user_data(user_data: u64) -> Option<Self> {
        let kind = OpKind::from_raw((user_data >> 32) as u32)?;
        let fd = (user_data & 0xffff_ffff) as u32;
        if fd > i32::MAX as u32 {
            return None;
        }
        Some(Self {
            fd: fd as RawFd,
            kind,
        })
    }
}
