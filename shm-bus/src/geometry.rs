//! Block geometry of one direction of the shared region.
//!
//! The region layout is fixed at configuration time and must match between
//! both sides exactly; only endpoint names and addresses are negotiated at
//! runtime. [`ChannelLayout::new`] is a `const fn`, so a mismatched or
//! impossible configuration fails at compile time when the layout is built
//! in a `const` context.

use crate::Error;

/// Blocks start on this alignment; block sizes are multiples of it.
pub const BLOCK_ALIGNMENT: usize = 4;

/// Size of the block header holding the payload size.
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Hard ceiling on blocks per direction; a block index must fit in one byte
/// of a notification.
pub const MAX_BLOCKS: usize = 256;

/// Worst-case bytes the link consumes per in-flight notification.
pub(crate) const BYTES_PER_MESSAGE: usize = 8;

/// Fixed overhead of the link's own bookkeeping inside the link area.
pub(crate) const LINK_AREA_OVERHEAD: usize = 2 * (24 + BYTES_PER_MESSAGE);

/// Derived geometry of one channel (TX or RX) of a shared region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Total size of the region this layout was derived from.
    pub total_size: usize,
    /// Offset of the blocks area. Everything before it belongs to the link.
    pub blocks_offset: usize,
    /// Size of one block, a multiple of [`BLOCK_ALIGNMENT`].
    pub block_size: usize,
    /// Number of blocks in this direction.
    pub block_count: usize,
}

impl ChannelLayout {
    /// Derive the layout for a region of `total_size` bytes carrying
    /// `local_blocks` blocks, whose opposite direction carries
    /// `remote_blocks` blocks.
    ///
    /// The link area is sized so the link can always hold one in-flight
    /// notification per block of either direction; whatever the alignment
    /// rounding leaves over widens the link area further.
    ///
    /// # Panics
    ///
    /// Panics when the block counts are zero or above [`MAX_BLOCKS`], or
    /// when the remaining space leaves blocks too small to hold a header
    /// plus one alignment unit. In a `const` context this is a compile
    /// error.
    pub const fn new(total_size: usize, local_blocks: usize, remote_blocks: usize) -> Self {
        assert!(local_blocks > 0 && local_blocks <= MAX_BLOCKS, "invalid local block count");
        assert!(remote_blocks > 0 && remote_blocks <= MAX_BLOCKS, "invalid remote block count");

        let link_min = Self::link_min_size(local_blocks, remote_blocks);
        assert!(total_size > link_min, "region too small for the link area");

        let block_size = ((total_size - link_min) / local_blocks) / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT;
        assert!(
            block_size >= BLOCK_HEADER_SIZE + BLOCK_ALIGNMENT,
            "region too small for the requested number of blocks"
        );

        ChannelLayout {
            total_size,
            blocks_offset: total_size - block_size * local_blocks,
            block_size,
            block_count: local_blocks,
        }
    }

    /// Fallible form of [`new`](Self::new) for configurations assembled at
    /// runtime, for example from a region whose size is only known after
    /// mapping it.
    pub fn try_new(
        total_size: usize,
        local_blocks: usize,
        remote_blocks: usize,
    ) -> Result<Self, Error> {
        if local_blocks == 0 || local_blocks > MAX_BLOCKS {
            return Err(Error::InvalidArgument);
        }
        if remote_blocks == 0 || remote_blocks > MAX_BLOCKS {
            return Err(Error::InvalidArgument);
        }
        let link_min = Self::link_min_size(local_blocks, remote_blocks);
        if total_size <= link_min {
            return Err(Error::InvalidArgument);
        }
        let block_size = ((total_size - link_min) / local_blocks) / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT;
        if block_size < BLOCK_HEADER_SIZE + BLOCK_ALIGNMENT {
            return Err(Error::InvalidArgument);
        }
        Ok(Self::new(total_size, local_blocks, remote_blocks))
    }

    /// Minimum link area size for the given block counts: enough to carry
    /// one notification per block that could simultaneously be allocated in
    /// either direction.
    pub const fn link_min_size(local_blocks: usize, remote_blocks: usize) -> usize {
        LINK_AREA_OVERHEAD + BYTES_PER_MESSAGE * (local_blocks + remote_blocks)
    }

    /// Largest payload a single allocation can carry: the entire blocks
    /// area minus one header.
    pub const fn max_allocable(&self) -> usize {
        self.block_size * self.block_count - BLOCK_HEADER_SIZE
    }
}
