//! The sequential-fit block suballocator.
//!
//! The buffer is divided into equal blocks described by a flat index of
//! packed words, one meaningful word per run of blocks. A rent scans runs
//! from a rotating cursor; a return just flips the occupied bit. Free
//! neighbors are *not* merged on return — the next scan that passes
//! through absorbs them on demand, which keeps return `O(1)` and
//! concentrates the coalescing cost where it pays off:
//!
//! ```text
//!  before rent(5):   [####|··2··|··3··|#######|·1·]
//!                          ^cursor
//!  the scan grows the 2-run by absorbing the 3-run, splits off the
//!  remainder, and parks the cursor at the new segment:
//!  after:            [####|#####|·1·|#######|·1·]
//!                          ^cursor
//! ```
//!
//! Entries absorbed by a merge keep their stale words; they become
//! unreachable from any run start, and a scan that later lands on one (the
//! cursor can be left on an absorbed entry by a failed scan) still reads a
//! sub-partition of the same free region, so the walk stays consistent.

use crate::buffer::RawBuffer;
use crate::collections::PagedVec;
use crate::error::{ConfigError, RentError, ReturnError};
use crate::suballocator::{impl_suballocator, RawSegment, RawSuballocator, Shared};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use hashbrown::HashMap;

const OCCUPIED_BIT: u32 = 1 << 31;
/// Largest run length representable in the 31-bit count field.
const MAX_RUN: usize = (OCCUPIED_BIT - 1) as usize;

fn pack(occupied: bool, blocks: usize) -> u32 {
    debug_assert!(blocks >= 1 && blocks <= MAX_RUN);
    blocks as u32 | if occupied { OCCUPIED_BIT } else { 0 }
}

fn is_occupied(word: u32) -> bool {
    word & OCCUPIED_BIT != 0
}

fn run_blocks(word: u32) -> usize {
    (word & !OCCUPIED_BIT) as usize
}

/// The single-threaded sequential-fit core.
pub(crate) struct RawSequential<T> {
    length: usize,
    block_length: usize,
    block_count: usize,
    index: PagedVec<u32>,
    tags: HashMap<usize, T>,
    cursor: usize,
    used: usize,
    allocations: usize,
}

impl<T: Clone> RawSequential<T> {
    fn new(length: usize, block_length: usize) -> Result<Self, ConfigError> {
        if length == 0 {
            return Err(ConfigError::ZeroLength);
        }
        if block_length == 0 {
            return Err(ConfigError::ZeroBlockLength);
        }
        if block_length > length {
            return Err(ConfigError::BlockLengthExceedsBuffer);
        }
        let block_count = length.div_ceil(block_length);
        let mut sequential = Self {
            length,
            block_length,
            block_count,
            index: PagedVec::new(block_count),
            tags: HashMap::new(),
            cursor: 0,
            used: 0,
            allocations: 0,
        };
        sequential.seed();
        Ok(sequential)
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    /// Cover `[0, block_count)` with free runs of at most `MAX_RUN` blocks.
    fn seed(&mut self) {
        let mut offset = 0;
        while offset < self.block_count {
            let chunk = (self.block_count - offset).min(MAX_RUN);
            self.index.set(offset, pack(false, chunk));
            offset += chunk;
        }
    }

    /// Unit length of a run, clamped to the buffer end for the run covering
    /// the partial tail block of a non-divisible buffer.
    fn run_units(&self, start_block: usize, blocks: usize) -> usize {
        let start = start_block * self.block_length;
        (blocks * self.block_length).min(self.length - start)
    }
}

impl<T: Clone> RawSuballocator<T> for RawSequential<T> {
    fn length(&self) -> usize {
        self.length
    }

    fn used(&self) -> usize {
        self.used
    }

    fn allocations(&self) -> usize {
        self.allocations
    }

    fn rent(&mut self, length: usize, tag: T) -> Result<RawSegment, RentError> {
        if length == 0 {
            return Err(RentError::InvalidLength);
        }
        let need = length.div_ceil(self.block_length);
        if need > self.block_count || need > MAX_RUN {
            return Err(RentError::NoSpace);
        }

        let mut index = self.cursor;
        // Total blocks stepped over; once it reaches the block count every
        // run has been visited and the request is unsatisfiable.
        let mut advanced = 0;
        loop {
            let word = self.index.get(index);
            let mut blocks = run_blocks(word);
            debug_assert!(blocks >= 1, "scan landed outside any recorded run");
            if !is_occupied(word) {
                // grow the run by absorbing the free runs after it
                while blocks < need {
                    let next = index + blocks;
                    if next >= self.block_count {
                        break;
                    }
                    let next_word = self.index.get(next);
                    if is_occupied(next_word) {
                        break;
                    }
                    let next_blocks = run_blocks(next_word);
                    if blocks + next_blocks > MAX_RUN {
                        break;
                    }
                    blocks += next_blocks;
                    self.index.set(index, pack(false, blocks));
                }
                if blocks >= need {
                    if blocks > need {
                        self.index.set(index + need, pack(false, blocks - need));
                    }
                    self.index.set(index, pack(true, need));
                    self.tags.insert(index, tag);
                    self.cursor = index;
                    let units = self.run_units(index, need);
                    self.used += units;
                    self.allocations += 1;
                    return Ok(RawSegment { offset: index * self.block_length, length: units });
                }
            }
            advanced += blocks;
            if advanced >= self.block_count {
                return Err(RentError::NoSpace);
            }
            index += blocks;
            if index >= self.block_count {
                index = 0;
            }
        }
    }

    fn restore(&mut self, offset: usize, length: usize) -> Result<T, ReturnError> {
        if offset % self.block_length != 0 {
            return Err(ReturnError::UnknownSegment);
        }
        let start = offset / self.block_length;
        if start >= self.block_count {
            return Err(ReturnError::UnknownSegment);
        }
        let word = self.index.get(start);
        if !is_occupied(word) {
            return Err(ReturnError::UnknownSegment);
        }
        let blocks = run_blocks(word);
        let units = self.run_units(start, blocks);
        if units != length {
            return Err(ReturnError::UnknownSegment);
        }
        let tag = self.tags.remove(&start).ok_or(ReturnError::UnknownSegment)?;
        self.index.set(start, pack(false, blocks));
        self.used -= units;
        self.allocations -= 1;
        Ok(tag)
    }

    fn clear(&mut self) {
        self.index.reset();
        self.tags.clear();
        self.cursor = 0;
        self.used = 0;
        self.allocations = 0;
        self.seed();
    }

    fn snapshot(&self, out: &mut Vec<(RawSegment, T)>) {
        let mut index = 0;
        while index < self.block_count {
            let word = self.index.get(index);
            let blocks = run_blocks(word);
            debug_assert!(blocks >= 1, "runs must partition the index");
            if is_occupied(word) {
                if let Some(tag) = self.tags.get(&index) {
                    out.push((
                        RawSegment {
                            offset: index * self.block_length,
                            length: self.run_units(index, blocks),
                        },
                        tag.clone(),
                    ));
                }
            }
            index += blocks;
        }
    }
}

/// A suballocator that linearly scans a block index from a rotating cursor
/// and coalesces free neighbors lazily, on the scan that revisits them.
///
/// Segments are whole runs of blocks, so their length is the requested
/// length rounded up to a block multiple. Return costs `O(1)`; rent is
/// `O(block_count)` worst case but typically stops near the cursor.
pub struct SequentialSuballocator<E, T = ()> {
    shared: Arc<Shared<E, T, RawSequential<T>>>,
}

impl<E, T> SequentialSuballocator<E, T>
where
    E: 'static,
    T: Clone + Send + 'static,
{
    /// Create an allocator over `length` units of internally allocated,
    /// owned memory, carved into blocks of `block_length` units.
    pub fn new(length: usize, block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawSequential::new(length, block_length)?;
        let buffer = RawBuffer::allocate(length)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Create an allocator over a caller-managed region.
    ///
    /// # Safety
    /// `base` must be aligned for `E` and point to at least `length`
    /// elements of storage that stays live and unmoved until the allocator
    /// is dropped.
    pub unsafe fn new_over(
        base: NonNull<E>,
        length: usize,
        block_length: usize,
    ) -> Result<Self, ConfigError> {
        let raw = RawSequential::new(length, block_length)?;
        let buffer = RawBuffer::borrow(base, length)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Create an allocator that takes ownership of `region`, pinning it for
    /// the allocator's lifetime.
    pub fn new_over_owned(region: Box<[E]>, block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawSequential::new(region.len(), block_length)?;
        let buffer = RawBuffer::adopt(region)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Block length in units.
    pub fn block_length(&self) -> usize {
        self.shared.with_raw(|raw| raw.block_length())
    }
}

impl_suballocator!(SequentialSuballocator);
