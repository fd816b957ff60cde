//! Shared regions, channel views and buffer validation.
//!
//! All raw-pointer arithmetic over the shared memory lives here. Every other
//! module addresses blocks by index and goes through [`Channel`] to touch
//! bytes, so the trust boundary with the peer is crossed in exactly one
//! place.
//!
//! Reads of peer-written blocks must (a) force a fresh view of the memory
//! before trusting it (cache invalidation plus a fence) and (b) bound-check
//! any length taken from it before use. The peer side may be stale, buggy or
//! compromised; a size field from shared memory is never trusted without
//! revalidation on every read.

use core::sync::atomic::{fence, Ordering};

use memmap2::MmapRaw;
use tracing::error;

use crate::geometry::{ChannelLayout, BLOCK_ALIGNMENT, BLOCK_HEADER_SIZE};
use crate::Error;

/// Cache maintenance over the shared region.
///
/// The two sides do not share coherent caches, so written ranges must be
/// flushed to the backing memory before notifying and ranges about to be
/// read must be invalidated first. Hosts with coherent memory (including
/// every test in this repository) use [`NoCache`]. Ordering fences are
/// issued by the callers regardless; cache maintenance is orthogonal to
/// ordering.
pub trait CacheMaintenance: Send + Sync {
    fn flush(&self, ptr: *const u8, len: usize);
    fn invalidate(&self, ptr: *const u8, len: usize);
}

/// No-op maintenance for cache-coherent hosts.
pub struct NoCache;

impl CacheMaintenance for NoCache {
    fn flush(&self, _ptr: *const u8, _len: usize) {}
    fn invalidate(&self, _ptr: *const u8, _len: usize) {}
}

/// A contiguous span of shared memory holding one direction's link area and
/// blocks area.
pub struct Region {
    base: *mut u8,
    len: usize,
    /// Keeps an fd-backed mapping alive for the lifetime of the region.
    /// Never accessed besides `Drop`.
    #[allow(dead_code)]
    map: Option<MmapRaw>,
}

// The region is plain shared bytes; all access is mediated by `Channel`
// under the protocol's ownership rules.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map a shared memory object.
    pub fn map<T: std::os::unix::io::AsRawFd>(fd: &T) -> Result<Self, std::io::Error> {
        let map = MmapRaw::map_raw(fd)?;
        Ok(Region {
            base: map.as_mut_ptr(),
            len: map.len(),
            map: Some(map),
        })
    }

    /// Wrap an externally provided span of shared memory.
    ///
    /// # Safety
    ///
    /// `base` must point to an allocation valid for `len` bytes that stays
    /// mapped for the lifetime of the region, aligned to
    /// [`BLOCK_ALIGNMENT`], and written by no one except this backend and
    /// the peer following the block protocol.
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Region { base, len, map: None }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Whether and how to validate the size field of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeCheck {
    /// Pure index bounds check, the header is not read.
    None,
    /// Read and bound-check the size; the memory is locally written (our
    /// own TX side), no invalidation needed.
    Trusted,
    /// Read and bound-check the size of peer-written memory, invalidating
    /// the header and the payload range as two separate steps so the header
    /// is never trusted before its own lines are fresh.
    Invalidate,
}

/// Blocks-area view of one direction.
pub(crate) struct Channel {
    blocks: *mut u8,
    block_size: usize,
    block_count: usize,
}

// Access is index-based and follows the allocation protocol: a block run is
// written only by the side that currently owns it.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    pub fn new(region: &Region, layout: &ChannelLayout) -> Result<Self, Error> {
        if region.len() < layout.total_size {
            return Err(Error::InvalidArgument);
        }
        // Safety: blocks_offset < total_size <= region.len by construction
        // of the layout and the check above.
        let blocks = unsafe { region.base.add(layout.blocks_offset) };
        if blocks as usize % BLOCK_ALIGNMENT != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Channel {
            blocks,
            block_size: layout.block_size,
            block_count: layout.block_count,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Size of the whole blocks area.
    pub fn allocable_size(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Pointer to the start of a block. Pure arithmetic, no validation.
    pub fn block_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.block_count);
        // Safety: in-bounds for the blocks area by the assert above.
        unsafe { self.blocks.add(index * self.block_size) }
    }

    /// Pointer to the payload of a block.
    pub fn data_ptr(&self, index: usize) -> *mut u8 {
        // Safety: header fits in every block per the layout invariants.
        unsafe { self.block_ptr(index).add(BLOCK_HEADER_SIZE) }
    }

    fn read_header(&self, index: usize) -> usize {
        // Volatile: the peer may have written it; alignment holds because
        // blocks start on BLOCK_ALIGNMENT and sizes are multiples of it.
        unsafe { (self.block_ptr(index) as *const u32).read_volatile() as usize }
    }

    pub fn write_header(&self, index: usize, size: usize) {
        debug_assert!(size <= u32::MAX as usize);
        unsafe { (self.block_ptr(index) as *mut u32).write_volatile(size as u32) }
    }

    /// Copy payload bytes into a block run the caller has allocated.
    pub fn copy_in(&self, index: usize, data: &[u8]) {
        debug_assert!(
            index * self.block_size + BLOCK_HEADER_SIZE + data.len() <= self.allocable_size()
        );
        // Safety: in-bounds per the assert; the run is exclusively owned by
        // the caller until the peer is notified.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr(index), data.len()) }
    }

    /// Borrow the payload of a block run.
    ///
    /// # Safety
    ///
    /// `index`/`len` must have passed [`validate`](Self::validate), and the
    /// run must not be concurrently written: either it is our allocation not
    /// yet handed to the peer, or the peer's buffer not yet released back.
    pub unsafe fn data_slice(&self, index: usize, len: usize) -> &[u8] {
        core::slice::from_raw_parts(self.data_ptr(index), len)
    }

    /// Mutably borrow the payload of a block run.
    ///
    /// # Safety
    ///
    /// Same as [`data_slice`](Self::data_slice), and the run must be
    /// exclusively owned by the caller.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_slice_mut(&self, index: usize, len: usize) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.data_ptr(index), len)
    }

    /// Validate a block index and, per `check`, the size stored in its
    /// header. Returns the validated payload size (zero for
    /// [`SizeCheck::None`]).
    pub fn validate(
        &self,
        index: usize,
        check: SizeCheck,
        cache: &dyn CacheMaintenance,
    ) -> Result<usize, Error> {
        if index >= self.block_count {
            error!(index, count = self.block_count, "block index out of range");
            return Err(Error::Corrupted);
        }
        if matches!(check, SizeCheck::None) {
            return Ok(0);
        }

        if matches!(check, SizeCheck::Invalidate) {
            cache.invalidate(self.block_ptr(index), BLOCK_HEADER_SIZE);
            fence(Ordering::SeqCst);
        }
        let allocable = self.allocable_size();
        let size = self.read_header(index);
        let data_end = index * self.block_size + BLOCK_HEADER_SIZE + size;
        if size > allocable - BLOCK_HEADER_SIZE || data_end > allocable {
            error!(index, size, "block corrupted");
            return Err(Error::Corrupted);
        }
        if matches!(check, SizeCheck::Invalidate) {
            cache.invalidate(self.data_ptr(index), size);
            fence(Ordering::SeqCst);
        }
        Ok(size)
    }

    /// Translate a payload pointer back to its block index.
    ///
    /// The candidate index is re-derived through [`validate`] and the
    /// resulting pointer must match exactly; pointers that are not
    /// block-aligned buffer starts are rejected.
    pub fn buffer_to_index(
        &self,
        buffer: *const u8,
        check: SizeCheck,
        cache: &dyn CacheMaintenance,
    ) -> Result<(usize, usize), Error> {
        let offset = (buffer as usize)
            .checked_sub(self.blocks as usize)
            .ok_or(Error::InvalidArgument)?;
        let index = offset / self.block_size;
        let size = self
            .validate(index, check, cache)
            .map_err(|_| Error::InvalidArgument)?;
        if self.data_ptr(index) as *const u8 != buffer {
            error!("buffer pointer is not a block start");
            return Err(Error::InvalidArgument);
        }
        Ok((index, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: usize = 8;
    const BLOCK_SIZE: usize = 32;

    fn leak_channel() -> Channel {
        let backing = Box::leak(vec![0u64; BLOCKS * BLOCK_SIZE / 8].into_boxed_slice());
        Channel {
            blocks: backing.as_mut_ptr() as *mut u8,
            block_size: BLOCK_SIZE,
            block_count: BLOCKS,
        }
    }

    #[test]
    fn header_round_trip() {
        let ch = leak_channel();
        ch.write_header(3, 17);
        assert_eq!(ch.validate(3, SizeCheck::Trusted, &NoCache), Ok(17));
        assert_eq!(ch.validate(3, SizeCheck::Invalidate, &NoCache), Ok(17));
        assert_eq!(ch.validate(3, SizeCheck::None, &NoCache), Ok(0));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let ch = leak_channel();
        assert_eq!(
            ch.validate(BLOCKS, SizeCheck::None, &NoCache),
            Err(Error::Corrupted)
        );
    }

    #[test]
    fn rejects_any_size_overrunning_the_region() {
        let ch = leak_channel();
        let allocable = BLOCKS * BLOCK_SIZE;
        for index in 0..BLOCKS {
            let room = allocable - index * BLOCK_SIZE - BLOCK_HEADER_SIZE;
            ch.write_header(index, room);
            assert!(ch.validate(index, SizeCheck::Invalidate, &NoCache).is_ok());

            for bad in [room + 1, allocable, u32::MAX as usize] {
                ch.write_header(index, bad);
                assert_eq!(
                    ch.validate(index, SizeCheck::Invalidate, &NoCache),
                    Err(Error::Corrupted),
                    "index {index} size {bad} must be rejected"
                );
            }
        }
    }

    #[test]
    fn pointer_round_trip_requires_exact_block_start() {
        let ch = leak_channel();
        ch.write_header(2, 5);
        let ptr = ch.data_ptr(2) as *const u8;
        assert_eq!(
            ch.buffer_to_index(ptr, SizeCheck::Trusted, &NoCache),
            Ok((2, 5))
        );
        // Off-by-one inside the same block is not a buffer start.
        let inside = unsafe { ptr.add(1) };
        assert_eq!(
            ch.buffer_to_index(inside, SizeCheck::Trusted, &NoCache),
            Err(Error::InvalidArgument)
        );
        // A pointer before the blocks area can never match.
        let before = ch.blocks.wrapping_sub(1) as *const u8;
        assert_eq!(
            ch.buffer_to_index(before, SizeCheck::None, &NoCache),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn copy_in_lands_in_payload() {
        let ch = leak_channel();
        ch.copy_in(1, b"hello");
        ch.write_header(1, 5);
        let got = unsafe { ch.data_slice(1, 5) };
        assert_eq!(got, b"hello");
    }
}
