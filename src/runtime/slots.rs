//! Connection slot table.
//!
//! One entry per possible descriptor value below the configured ceiling.
//! Each slot records the single operation currently outstanding for its
//! descriptor; completions are checked against it before dispatch.

use crate::runtime::OpKind;
use std::collections::TryReserveError;
use std::os::unix::io::RawFd;

/// Pending operation recorded for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Never assigned, or retired after close.
    #[default]
    Vacant,
    /// Receive outstanding.
    AwaitingRead,
    /// Send outstanding for `buf[sent..len]`.
    AwaitingWrite {
        /// Bytes of the echo payload already sent.
        sent: u32,
        /// Total echo payload length.
        len: u32,
    },
}

impl SlotState {
    /// Operation kind a completion must carry to match this state.
    pub fn kind(self) -> Option<OpKind> {
        match self {
            SlotState::Vacant => None,
            SlotState::AwaitingRead => Some(OpKind::Read),
            SlotState::AwaitingWrite { .. } => Some(OpKind::Write),
        }
    }
}

/// Error for descriptors the table cannot hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverCeiling {
    pub fd: RawFd,
    pub ceiling: usize,
}

impl std::fmt::Display for OverCeiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "descriptor {} outside slot table of {}",
            self.fd, self.ceiling
        )
    }
}

impl std::error::Error for OverCeiling {}

/// Fixed-capacity table keyed directly by descriptor value.
///
/// Slots are overwritten when the OS hands out a recycled descriptor;
/// there is no removal beyond [`SlotTable::retire`].
pub struct SlotTable {
    slots: Box<[SlotState]>,
}

impl SlotTable {
    /// Allocate a table for descriptors `0..ceiling`.
    pub fn new(ceiling: usize) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(ceiling)?;
        slots.resize(ceiling, SlotState::Vacant);
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Descriptor ceiling (number of slots).
    pub fn ceiling(&self) -> usize {
        self.slots.len()
    }

    /// Whether `fd` falls inside the table.
    pub fn admits(&self, fd: RawFd) -> bool {
        self.index(fd).is_some()
    }

    /// Record that `fd` now has `state` outstanding.
    pub fn assign(&mut self, fd: RawFd, state: SlotState) -> Result<(), OverCeiling> {
        let ceiling = self.ceiling();
        let idx = self.index(fd).ok_or(OverCeiling { fd, ceiling })?;
        self.slots[idx] = state;
        Ok(())
    }

    /// Last assigned state for `fd`; `None` when outside the table.
    pub fn lookup(&self, fd: RawFd) -> Option<SlotState> {
        self.index(fd).map(|idx| self.slots[idx])
    }

    /// Mark `fd` closed so late completions for it are discarded.
    pub fn retire(&mut self, fd: RawFd) {
        if let Some(idx) = self.index(fd) {
            self.slots[idx] = SlotState::Vacant;
        }
    }

    /// Number of descriptors with an operation outstanding.
    #[allow(dead_code)]
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| **s != SlotState::Vacant)
            .count()
    }

    /// Retire every occupied slot, returning the descriptors that held one.
    pub fn retire_all(&mut self) -> Vec<RawFd> {
        let mut open = Vec::new();
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if *slot != SlotState::Vacant {
                *slot = SlotState::Vacant;
                open.push(fd as RawFd);
            }
        }
        open
    }

    fn index(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd)
            .ok()
            .filter(|&idx| idx < self.slots.len())
    }
}
