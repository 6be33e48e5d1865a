use log::trace;

use crate::error::{Error, Result};

/// Maximum number of physical chunks a single allocator may create
pub const MAX_CHUNKS: usize = 16;

/// Maximum number of free blocks tracked per chunk or buffer layout
pub const MAX_FREE_BLOCKS: usize = 256;

/// Capacity given to the final allowed chunk. No further chunk can be
/// created after it, so it must be able to absorb any request.
const FINAL_CHUNK_CAPACITY: usize = usize::MAX / 2;

/// An unallocated `(offset, size)` range. Zero-size blocks are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Byte offset from the start of the owning chunk or buffer
    pub offset: usize,
    /// Size in bytes, always greater than zero
    pub size: usize,
}

impl FreeBlock {
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Sorted free-block list with immediate coalescing, shared by the chunk
/// allocator and the planner's buffer layouts.
///
/// Invariant: blocks are ordered by offset, never overlap, and no two
/// adjacent blocks coexist (they are merged on insert).
#[derive(Debug, Clone, Default)]
pub(crate) struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    pub(crate) fn with_block(offset: usize, size: usize) -> Self {
        Self {
            blocks: vec![FreeBlock { offset, size }],
        }
    }

    pub(crate) fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    pub(crate) fn last_block(&self) -> Option<&FreeBlock> {
        self.blocks.last()
    }

    /// Index of the smallest interior block (every block except the last)
    /// that can hold `size` bytes. The last block is the growable tail and
    /// is kept available for future growth.
    pub(crate) fn best_interior_fit(&self, size: usize) -> Option<usize> {
        let interior = self.blocks.len().saturating_sub(1);
        self.blocks[..interior]
            .iter()
            .enumerate()
            .filter(|(_, block)| block.size >= size)
            .min_by_key(|(_, block)| block.size)
            .map(|(idx, _)| idx)
    }

    /// Carve `size` bytes from the front of block `idx`. The caller must
    /// have checked that the block is large enough.
    pub(crate) fn take(&mut self, idx: usize, size: usize) -> usize {
        let block = &mut self.blocks[idx];
        let offset = block.offset;
        block.offset += size;
        block.size -= size;
        if block.size == 0 {
            self.blocks.remove(idx);
        }
        offset
    }

    /// Insert a freed range in offset order, merging with exactly-adjacent
    /// neighbours. Overlap with an existing block means the free list no
    /// longer describes disjoint ranges and is reported as corruption.
    pub(crate) fn insert(&mut self, offset: usize, size: usize) -> Result<()> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Backend(format!("freed range {}+{} overflows", offset, size)))?;
        let pos = self.blocks.partition_point(|block| block.offset < offset);

        if pos > 0 && self.blocks[pos - 1].end() > offset {
            return Err(Error::Backend(format!(
                "freed range at offset {} overlaps preceding free block",
                offset
            )));
        }
        if pos < self.blocks.len() && end > self.blocks[pos].offset {
            return Err(Error::Backend(format!(
                "freed range at offset {} overlaps following free block",
                offset
            )));
        }

        let merge_prev = pos > 0 && self.blocks[pos - 1].end() == offset;
        let merge_next = pos < self.blocks.len() && self.blocks[pos].offset == end;
        match (merge_prev, merge_next) {
            (true, true) => {
                self.blocks[pos - 1].size += size + self.blocks[pos].size;
                self.blocks.remove(pos);
            }
            (true, false) => {
                self.blocks[pos - 1].size += size;
            }
            (false, true) => {
                let next = &mut self.blocks[pos];
                next.offset = offset;
                next.size += size;
            }
            (false, false) => {
                if self.blocks.len() >= MAX_FREE_BLOCKS {
                    return Err(Error::Backend(format!(
                        "free-block list is full ({} blocks)",
                        MAX_FREE_BLOCKS
                    )));
                }
                self.blocks.insert(pos, FreeBlock { offset, size });
            }
        }
        Ok(())
    }
}

/// Round `size` up to a multiple of `alignment`. Returns `None` when the
/// alignment is zero or the rounded size overflows.
pub(crate) fn align_up(size: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 {
        return None;
    }
    let remainder = size % alignment;
    if remainder == 0 {
        Some(size)
    } else {
        size.checked_add(alignment - remainder)
    }
}

/// One fixed-capacity arena segment.
#[derive(Debug, Clone)]
struct Chunk {
    /// Fixed capacity in bytes
    capacity: usize,
    /// High-water mark: the furthest byte ever handed out
    max_size: usize,
    /// Free ranges within the chunk
    free: FreeList,
}

/// Placement returned by a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    /// Index of the chunk the range lives in
    pub chunk: usize,
    /// Byte offset within the chunk
    pub offset: usize,
    /// Size actually reserved, rounded up to the effective alignment
    pub size: usize,
}

/// Per-buffer arena allocator over zero or more fixed-capacity chunks.
///
/// Placement is reuse-first: the smallest interior free block that fits is
/// preferred (best-fit), falling back to chunk tail blocks chosen by a
/// signed reuse factor, and only then to creating a new chunk. The
/// allocator tracks offsets only; real bytes belong to an external backend.
#[derive(Debug, Clone)]
pub struct ChunkAllocator {
    alignment: usize,
    max_chunk_size: usize,
    chunks: Vec<Chunk>,
}

impl ChunkAllocator {
    /// Create an allocator. Both `alignment` and `max_chunk_size` must be
    /// greater than zero.
    pub fn new(alignment: usize, max_chunk_size: usize) -> Result<Self> {
        Self::validate_config(alignment, max_chunk_size)?;
        Ok(Self {
            alignment,
            max_chunk_size,
            chunks: Vec::new(),
        })
    }

    /// Reconfigure the allocator and drop all chunks.
    pub fn configure(&mut self, alignment: usize, max_chunk_size: usize) -> Result<()> {
        Self::validate_config(alignment, max_chunk_size)?;
        self.alignment = alignment;
        self.max_chunk_size = max_chunk_size;
        self.chunks.clear();
        Ok(())
    }

    fn validate_config(alignment: usize, max_chunk_size: usize) -> Result<()> {
        if alignment == 0 {
            return Err(Error::InvalidArgument(
                "alignment must be greater than zero".to_string(),
            ));
        }
        if max_chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "max chunk size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Allocate `size` bytes using the configured alignment and chunk size.
    pub fn allocate(&mut self, size: usize) -> Result<ChunkPlacement> {
        self.allocate_with(size, None, None)
    }

    /// Allocate `size` bytes, optionally overriding the alignment or the
    /// maximum chunk size for this call only.
    pub fn allocate_with(
        &mut self,
        size: usize,
        alignment: Option<usize>,
        max_chunk_size: Option<usize>,
    ) -> Result<ChunkPlacement> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be greater than zero".to_string(),
            ));
        }
        let alignment = alignment.unwrap_or(self.alignment);
        let max_chunk_size = max_chunk_size.unwrap_or(self.max_chunk_size);
        let aligned = align_up(size, alignment).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "size {} cannot be aligned to {}",
                size, alignment
            ))
        })?;

        // best fit among interior blocks across all chunks
        let mut best: Option<(usize, usize, usize)> = None;
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            if let Some(block_idx) = chunk.free.best_interior_fit(aligned) {
                let block_size = chunk.free.blocks()[block_idx].size;
                if best.map_or(true, |(_, _, current)| block_size < current) {
                    best = Some((chunk_idx, block_idx, block_size));
                }
            }
        }

        let (chunk_idx, block_idx) = match best {
            Some((chunk_idx, block_idx, _)) => (chunk_idx, block_idx),
            None => match self.best_tail_fit(aligned) {
                Some(placement) => placement,
                None => {
                    let chunk_idx = self.new_chunk(aligned, max_chunk_size)?;
                    (chunk_idx, 0)
                }
            },
        };

        self.commit(chunk_idx, block_idx, aligned)
    }

    /// Among the tail blocks large enough for the request, pick the one
    /// whose post-allocation end lands closest to the chunk's high-water
    /// mark. The reuse factor is positive when the allocation fits below
    /// the mark (leftover slack) and negative when the mark must grow;
    /// the smallest non-negative factor wins, else the greatest negative.
    fn best_tail_fit(&self, size: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, i128)> = None;
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            let block = match chunk.free.last_block() {
                Some(block) if block.size >= size => block,
                _ => continue,
            };
            let block_idx = chunk.free.blocks().len() - 1;
            let reuse = chunk.max_size as i128 - (block.offset as i128 + size as i128);
            let better = match best {
                None => true,
                Some((_, _, current)) => {
                    (current < 0 && reuse > current) || (reuse >= 0 && reuse < current)
                }
            };
            if better {
                best = Some((chunk_idx, block_idx, reuse));
            }
        }
        best.map(|(chunk_idx, block_idx, _)| (chunk_idx, block_idx))
    }

    fn new_chunk(&mut self, min_size: usize, max_chunk_size: usize) -> Result<usize> {
        if self.chunks.len() >= MAX_CHUNKS {
            return Err(Error::Backend(format!(
                "chunk ceiling of {} reached",
                MAX_CHUNKS
            )));
        }
        // the final allowed chunk must absorb anything that follows
        let capacity = if self.chunks.len() == MAX_CHUNKS - 1 {
            FINAL_CHUNK_CAPACITY
        } else {
            min_size.max(max_chunk_size)
        };
        self.chunks.push(Chunk {
            capacity,
            max_size: 0,
            free: FreeList::with_block(0, capacity),
        });
        trace!(
            "created chunk {} with capacity {}",
            self.chunks.len() - 1,
            capacity
        );
        Ok(self.chunks.len() - 1)
    }

    fn commit(&mut self, chunk_idx: usize, block_idx: usize, aligned: usize) -> Result<ChunkPlacement> {
        let chunk = &mut self.chunks[chunk_idx];
        let block = chunk.free.blocks()[block_idx];
        let end = block
            .offset
            .checked_add(aligned)
            .ok_or_else(|| Error::Backend("allocation end offset overflows".to_string()))?;
        let offset = chunk.free.take(block_idx, aligned);
        if end > chunk.max_size {
            chunk.max_size = end;
        }
        trace!(
            "allocated {} bytes at chunk {} offset {}",
            aligned,
            chunk_idx,
            offset
        );
        Ok(ChunkPlacement {
            chunk: chunk_idx,
            offset,
            size: aligned,
        })
    }

    /// Return a previously allocated range to the free list, merging with
    /// adjacent free blocks.
    pub fn release(&mut self, chunk: usize, offset: usize, size: usize) -> Result<()> {
        let aligned = align_up(size, self.alignment)
            .ok_or_else(|| Error::Backend(format!("released size {} overflows", size)))?;
        let chunk_count = self.chunks.len();
        let entry = self.chunks.get_mut(chunk).ok_or_else(|| {
            Error::Backend(format!("invalid chunk id {} ({} chunks)", chunk, chunk_count))
        })?;
        let end = offset
            .checked_add(aligned)
            .ok_or_else(|| Error::Backend("released range end overflows".to_string()))?;
        if end > entry.max_size {
            return Err(Error::Backend(format!(
                "released range {}..{} exceeds chunk {} high-water mark {}",
                offset, end, chunk, entry.max_size
            )));
        }
        entry.free.insert(offset, aligned)?;
        trace!("released {} bytes at chunk {} offset {}", aligned, chunk, offset);
        Ok(())
    }

    /// Drop all chunks, returning the allocator to its freshly configured
    /// state.
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// High-water mark of a chunk: the number of bytes the physical backend
    /// must provide for it.
    pub fn chunk_size(&self, chunk: usize) -> Option<usize> {
        self.chunks.get(chunk).map(|entry| entry.max_size)
    }

    /// Sum of all chunk high-water marks.
    pub fn total_reserved(&self) -> usize {
        self.chunks.iter().map(|entry| entry.max_size).sum()
    }

    #[cfg(test)]
    fn free_block_count(&self, chunk: usize) -> usize {
        self.chunks[chunk].free.blocks().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 16), Some(32));
        assert_eq!(align_up(5, 0), None);
        assert_eq!(align_up(usize::MAX, 16), None);
    }

    #[test]
    fn test_first_allocation_lands_in_chunk_zero() {
        // alignment 16, max chunk size 64: Allocate(17) -> chunk 0, offset 0,
        // aligned size 32
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        let placement = alloc.allocate(17).unwrap();
        assert_eq!(placement.chunk, 0);
        assert_eq!(placement.offset, 0);
        assert_eq!(placement.size, 32);
    }

    #[test]
    fn test_oversized_request_opens_new_chunk() {
        // after the 32-byte allocation chunk 0 only has a 32-byte gap left,
        // so a 64-byte request must open chunk 1 at offset 0
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        alloc.allocate(17).unwrap();
        let placement = alloc.allocate(64).unwrap();
        assert_eq!(placement.chunk, 1);
        assert_eq!(placement.offset, 0);
        assert_eq!(placement.size, 64);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        assert!(alloc.allocate(0).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ChunkAllocator::new(0, 64).is_err());
        assert!(ChunkAllocator::new(16, 0).is_err());
    }

    #[test]
    fn test_alignment_invariant() {
        let mut alloc = ChunkAllocator::new(32, 4096).unwrap();
        for size in [1, 31, 32, 33, 100, 1000] {
            let placement = alloc.allocate(size).unwrap();
            assert_eq!(placement.offset % 32, 0);
            assert_eq!(placement.size % 32, 0);
            assert!(placement.size >= size);
        }
    }

    #[test]
    fn test_reuse_before_growth() {
        let mut alloc = ChunkAllocator::new(16, 1024).unwrap();
        let a = alloc.allocate(256).unwrap();
        let _b = alloc.allocate(256).unwrap();
        alloc.release(a.chunk, a.offset, a.size).unwrap();
        // a free block large enough exists, so no new chunk may be created
        let c = alloc.allocate(128).unwrap();
        assert_eq!(alloc.chunk_count(), 1);
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn test_best_fit_prefers_smallest_interior_block() {
        let mut alloc = ChunkAllocator::new(16, 4096).unwrap();
        let a = alloc.allocate(512).unwrap();
        let _keep1 = alloc.allocate(16).unwrap();
        let b = alloc.allocate(128).unwrap();
        let _keep2 = alloc.allocate(16).unwrap();
        alloc.release(a.chunk, a.offset, a.size).unwrap();
        alloc.release(b.chunk, b.offset, b.size).unwrap();
        // both gaps fit, the 128-byte gap is the tighter fit
        let c = alloc.allocate(96).unwrap();
        assert_eq!(c.offset, b.offset);
    }

    #[test]
    fn test_release_coalesces_adjacent_blocks() {
        let mut alloc = ChunkAllocator::new(16, 4096).unwrap();
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let c = alloc.allocate(64).unwrap();
        let _guard = alloc.allocate(64).unwrap();
        // freeing three adjacent ranges must leave exactly one free block
        // spanning all three (plus the tail block)
        alloc.release(a.chunk, a.offset, a.size).unwrap();
        alloc.release(c.chunk, c.offset, c.size).unwrap();
        alloc.release(b.chunk, b.offset, b.size).unwrap();
        assert_eq!(alloc.free_block_count(0), 2);
        let merged = alloc.allocate(192).unwrap();
        assert_eq!(merged.offset, a.offset);
    }

    #[test]
    fn test_release_validates_chunk_id() {
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        alloc.allocate(16).unwrap();
        assert!(alloc.release(7, 0, 16).is_err());
    }

    #[test]
    fn test_release_validates_high_water_mark() {
        let mut alloc = ChunkAllocator::new(16, 1024).unwrap();
        alloc.allocate(64).unwrap();
        // past the 64-byte high-water mark
        assert!(alloc.release(0, 128, 64).is_err());
    }

    #[test]
    fn test_double_release_detected() {
        let mut alloc = ChunkAllocator::new(16, 1024).unwrap();
        let a = alloc.allocate(64).unwrap();
        let _b = alloc.allocate(64).unwrap();
        alloc.release(a.chunk, a.offset, a.size).unwrap();
        assert!(alloc.release(a.chunk, a.offset, a.size).is_err());
    }

    #[test]
    fn test_tail_fit_prefers_reused_space() {
        let mut alloc = ChunkAllocator::new(16, 256).unwrap();
        // fill chunk 0 completely, then grow into chunk 1 partially
        let a = alloc.allocate(256).unwrap();
        assert_eq!(a.chunk, 0);
        let b = alloc.allocate(128).unwrap();
        assert_eq!(b.chunk, 1);
        // free both tails: chunk 0's tail sits below its high-water mark,
        // chunk 1's tail would need to grow past its mark
        alloc.release(a.chunk, a.offset, a.size).unwrap();
        let c = alloc.allocate(64).unwrap();
        assert_eq!(c.chunk, 0, "already-touched space must win over growth");
    }

    #[test]
    fn test_reset_clears_chunks() {
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        alloc.allocate(32).unwrap();
        alloc.reset();
        assert_eq!(alloc.chunk_count(), 0);
        assert_eq!(alloc.total_reserved(), 0);
    }

    #[test]
    fn test_configure_resets_state() {
        let mut alloc = ChunkAllocator::new(16, 64).unwrap();
        alloc.allocate(32).unwrap();
        alloc.configure(32, 128).unwrap();
        assert_eq!(alloc.chunk_count(), 0);
        assert_eq!(alloc.alignment(), 32);
        assert_eq!(alloc.max_chunk_size(), 128);
    }

    #[test]
    fn test_chunk_sizes_track_high_water() {
        let mut alloc = ChunkAllocator::new(16, 128).unwrap();
        alloc.allocate(48).unwrap();
        assert_eq!(alloc.chunk_size(0), Some(48));
        alloc.allocate(48).unwrap();
        assert_eq!(alloc.chunk_size(0), Some(96));
        assert_eq!(alloc.chunk_size(1), None);
    }
}
