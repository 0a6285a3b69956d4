//! Per-shard buffer arena.
//!
//! One fixed-stride region per descriptor, carved out of a single
//! cache-line-aligned allocation. No allocation happens per operation:
//! a receive fills the descriptor's region in place and the echo send
//! reads the same bytes back out of it.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::os::unix::io::RawFd;

/// Alignment of the arena and therefore of every stride-aligned slice.
pub const CACHE_LINE: usize = 64;

/// Fixed-stride buffer arena addressed by descriptor.
pub struct BufferPool {
    ptr: *mut u8,
    layout: Layout,
    slots: usize,
    stride: usize,
}

impl BufferPool {
    /// Allocate `slots` regions of `stride` bytes each.
    ///
    /// Pages are zero-filled lazily by the OS, so an arena sized for a large
    /// descriptor ceiling costs only what connections actually touch.
    pub fn new(slots: usize, stride: usize) -> io::Result<Self> {
        if slots == 0 || stride == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer arena needs at least one non-empty slot",
            ));
        }

        let size = slots.checked_mul(stride).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "buffer arena size overflows")
        })?;
        let layout = Layout::from_size_align(size, CACHE_LINE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate buffer arena",
            ));
        }

        Ok(Self {
            ptr,
            layout,
            slots,
            stride,
        })
    }

    /// Size of each descriptor's region.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of descriptor regions.
    #[allow(dead_code)]
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Region reserved for `fd`, or `None` if `fd` is outside the arena.
    #[allow(dead_code)] // the kernel fills and drains slices through as_mut_ptr
    pub fn slice_for(&mut self, fd: RawFd) -> Option<&mut [u8]> {
        let offset = self.offset(fd)?;
        // SAFETY: offset + stride lies inside the allocation, and the
        // returned borrow is tied to &mut self.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), self.stride) })
    }

    /// Raw pointer to `fd`'s region for handing to the kernel.
    ///
    /// The pointer stays valid until the pool is dropped. The caller must not
    /// touch the region through [`BufferPool::slice_for`] while an operation
    /// using it is in flight.
    pub fn as_mut_ptr(&mut self, fd: RawFd) -> Option<*mut u8> {
        let offset = self.offset(fd)?;
        Some(unsafe { self.ptr.add(offset) })
    }

    fn offset(&self, fd: RawFd) -> Option<usize> {
        let idx = usize::try_from(fd).ok().filter(|&idx| idx < self.slots)?;
        Some(idx * self.stride)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// Safety: the arena is moved into exactly one shard thread and handed back
// to the coordinator only after that thread has finished with it.
unsafe impl Send for BufferPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_are_disjoint() {
        let mut pool = BufferPool::new(4, 128).unwrap();
        assert_eq!(pool.slots(), 4);
        assert_eq!(pool.stride(), 128);

        pool.slice_for(1).unwrap()[..4].copy_from_slice(b"ping");
        pool.slice_for(2).unwrap()[..4].copy_from_slice(b"pong");

        assert_eq!(&pool.slice_for(1).unwrap()[..4], b"ping");
        assert_eq!(&pool.slice_for(2).unwrap()[..4], b"pong");
        assert_eq!(pool.slice_for(3).unwrap().len(), 128);
        assert!(pool.slice_for(3).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alignment_and_bounds() {
        let mut pool = BufferPool::new(8, 2048).unwrap();

        let base = pool.as_mut_ptr(0).unwrap() as usize;
        assert_eq!(base % CACHE_LINE, 0);
        assert_eq!(pool.as_mut_ptr(3).unwrap() as usize - base, 3 * 2048);

        assert!(pool.slice_for(8).is_none());
        assert!(pool.slice_for(-1).is_none());
        assert!(pool.as_mut_ptr(8).is_none());
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        assert!(BufferPool::new(0, 2048).is_err());
        assert!(BufferPool::new(16, 0).is_err());
        assert_eq!(
            BufferPool::new(usize::MAX, 2).err().map(|e| e.kind()),
            Some(io::ErrorKind::OutOfMemory)
        );
    }
}
