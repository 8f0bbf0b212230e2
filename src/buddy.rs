//! The buddy suballocator.
//!
//! Memory is carved into blocks whose sizes are powers of two of a minimum
//! block length. A block of `2^k` blocks starting at block `i` has a buddy
//! at `i ^ 2^k`; splitting a block yields two buddies of the order below,
//! and returning a block re-merges it with its buddy whenever that buddy is
//! itself a whole free block of the same order. Free blocks of each order
//! form an intrusive doubly-linked list threaded through the index entries,
//! and a word of per-order bits (`free_flags`) routes a rent to the
//! smallest adequate order without walking anything:
//!
//! ```text
//!  order:        3    2    1    0
//!  free_flags:   1    0    1    1
//!                │         │    └ free_heads[0] → 5
//!                │         └───── free_heads[1] → 2 ⇄ 10
//!                └─────────────── free_heads[3] → 8
//!
//!  rent of 3 blocks → want = 4 → mask off orders < 2 → lowest set bit
//!  is order 3 → take block 8, split once, free half goes to order 2.
//! ```
//!
//! Rent and return are both `O(log(length / min_block_length))`.

use crate::buffer::RawBuffer;
use crate::error::{ConfigError, RentError, ReturnError};
use crate::suballocator::{impl_suballocator, RawSegment, RawSuballocator, Shared};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use hashbrown::HashMap;

/// Absent-link sentinel for the intrusive free lists.
const NONE: u32 = u32::MAX;

const VALID: u8 = 0b1000_0000;
const OCCUPIED: u8 = 0b0100_0000;
const ORDER_MASK: u8 = 0b0011_1111;

/// One block-index slot: two flag bits and the block-count order packed
/// into a byte, plus the free-list links. An entry is meaningful only at
/// the first block of a run; `Default` (all zero) is the invalid state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BuddyEntry {
    flags: u8,
    prev_free: u32,
    next_free: u32,
}

impl BuddyEntry {
    fn is_valid(self) -> bool {
        self.flags & VALID != 0
    }

    fn is_occupied(self) -> bool {
        self.flags & OCCUPIED != 0
    }

    fn order(self) -> u32 {
        u32::from(self.flags & ORDER_MASK)
    }
}

/// The single-threaded buddy core. Works purely in block and unit offsets.
pub(crate) struct RawBuddy<T> {
    length: usize,
    min_block: usize,
    block_count: usize,
    max_order: u32,
    entries: Vec<BuddyEntry>,
    free_heads: Vec<u32>,
    free_flags: u64,
    tags: HashMap<u32, T>,
    used: usize,
    allocations: usize,
}

impl<T: Clone> RawBuddy<T> {
    fn new(length: usize, min_block_length: usize) -> Result<Self, ConfigError> {
        if length == 0 {
            return Err(ConfigError::ZeroLength);
        }
        if min_block_length == 0 {
            return Err(ConfigError::ZeroBlockLength);
        }
        let min_block = min_block_length.next_power_of_two();
        if min_block > length {
            return Err(ConfigError::BlockLengthExceedsBuffer);
        }
        let block_count = length / min_block;
        if block_count > u32::MAX as usize {
            return Err(ConfigError::IndexTooLarge);
        }
        let max_order = block_count.next_power_of_two().trailing_zeros();
        let mut buddy = Self {
            length,
            min_block,
            block_count,
            max_order,
            entries: vec![BuddyEntry::default(); block_count],
            free_heads: vec![NONE; max_order as usize + 1],
            free_flags: 0,
            tags: HashMap::new(),
            used: 0,
            allocations: 0,
        };
        buddy.seed();
        Ok(buddy)
    }

    fn min_block_length(&self) -> usize {
        self.min_block
    }

    /// Lay the largest power-of-two free runs over `[0, block_count)`, high
    /// orders first. Each run lands on an offset aligned to its size
    /// because the higher bits of `block_count` were placed before it.
    fn seed(&mut self) {
        let mut offset = 0;
        for order in (0..=self.max_order).rev() {
            if self.block_count & (1usize << order) != 0 {
                self.push_free(offset, order);
                offset += 1 << order;
            }
        }
    }

    fn push_free(&mut self, index: usize, order: u32) {
        let head = self.free_heads[order as usize];
        self.entries[index] = BuddyEntry {
            flags: VALID | order as u8,
            prev_free: NONE,
            next_free: head,
        };
        if head != NONE {
            self.entries[head as usize].prev_free = index as u32;
        }
        self.free_heads[order as usize] = index as u32;
        self.free_flags |= 1 << order;
    }

    fn unlink(&mut self, index: usize, order: u32) {
        let entry = self.entries[index];
        debug_assert!(entry.is_valid() && !entry.is_occupied() && entry.order() == order);
        if entry.prev_free == NONE {
            self.free_heads[order as usize] = entry.next_free;
        } else {
            self.entries[entry.prev_free as usize].next_free = entry.next_free;
        }
        if entry.next_free != NONE {
            self.entries[entry.next_free as usize].prev_free = entry.prev_free;
        }
        if self.free_heads[order as usize] == NONE {
            self.free_flags &= !(1u64 << order);
        }
    }
}

impl<T: Clone> RawSuballocator<T> for RawBuddy<T> {
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
        let want_blocks = length.div_ceil(self.min_block).next_power_of_two();
        if want_blocks > 1usize << self.max_order {
            return Err(RentError::NoSpace);
        }
        let order_min = want_blocks.trailing_zeros();
        // Orders below `order_min` cannot satisfy the request; masking their
        // bits away and taking the lowest remaining one picks the smallest
        // adequate non-empty free list.
        let candidates = self.free_flags & !(want_blocks as u64 - 1);
        if candidates == 0 {
            return Err(RentError::NoSpace);
        }
        let order = candidates.trailing_zeros();
        let index = self.free_heads[order as usize] as usize;
        self.unlink(index, order);
        for split in (order_min..order).rev() {
            self.push_free(index + (1usize << split), split);
        }
        self.entries[index] = BuddyEntry {
            flags: VALID | OCCUPIED | order_min as u8,
            prev_free: NONE,
            next_free: NONE,
        };
        self.tags.insert(index as u32, tag);
        let units = want_blocks * self.min_block;
        self.used += units;
        self.allocations += 1;
        Ok(RawSegment { offset: index * self.min_block, length: units })
    }

    fn restore(&mut self, offset: usize, length: usize) -> Result<T, ReturnError> {
        if offset % self.min_block != 0 {
            return Err(ReturnError::UnknownSegment);
        }
        let start = offset / self.min_block;
        if start >= self.block_count {
            return Err(ReturnError::UnknownSegment);
        }
        let entry = self.entries[start];
        if !entry.is_valid() || !entry.is_occupied() {
            return Err(ReturnError::UnknownSegment);
        }
        let units = (1usize << entry.order()) * self.min_block;
        if units != length {
            return Err(ReturnError::UnknownSegment);
        }
        let tag = self.tags.remove(&(start as u32)).ok_or(ReturnError::UnknownSegment)?;
        // Invalidating the entry up front is what makes a double return
        // detectable.
        self.entries[start] = BuddyEntry::default();
        self.used -= units;
        self.allocations -= 1;

        let mut index = start;
        let mut order = entry.order();
        loop {
            let buddy = index ^ (1usize << order);
            if buddy >= self.block_count {
                self.push_free(index, order);
                break;
            }
            let buddy_entry = self.entries[buddy];
            if !buddy_entry.is_valid()
                || buddy_entry.is_occupied()
                || buddy_entry.order() != order
            {
                self.push_free(index, order);
                break;
            }
            self.unlink(buddy, order);
            self.entries[buddy] = BuddyEntry::default();
            index = index.min(buddy);
            order += 1;
        }
        Ok(tag)
    }

    fn clear(&mut self) {
        self.entries.fill(BuddyEntry::default());
        self.free_heads.fill(NONE);
        self.free_flags = 0;
        self.tags.clear();
        self.used = 0;
        self.allocations = 0;
        self.seed();
    }

    fn snapshot(&self, out: &mut Vec<(RawSegment, T)>) {
        let mut index = 0;
        while index < self.block_count {
            let entry = self.entries[index];
            debug_assert!(entry.is_valid(), "runs must partition the index");
            let blocks = 1usize << entry.order();
            if entry.is_occupied() {
                if let Some(tag) = self.tags.get(&(index as u32)) {
                    out.push((
                        RawSegment {
                            offset: index * self.min_block,
                            length: blocks * self.min_block,
                        },
                        tag.clone(),
                    ));
                }
            }
            index += blocks;
        }
    }
}

/// A suballocator handing out power-of-two-sized segments from an implicit
/// buddy tree.
///
/// Segment lengths are the requested length rounded up to the next power
/// of two of whole minimum blocks, so a rent of 5 units with a minimum
/// block of 4 yields an 8-unit segment. In exchange, rent and return cost
/// `O(log n)` and freed space re-coalesces aggressively.
///
/// ```
/// use suballoc::{BuddySuballocator, Suballocator};
///
/// let allocator = BuddySuballocator::<u8>::new(256, 4).unwrap();
/// let segment = allocator.try_rent(5, ()).unwrap();
/// assert_eq!(segment.len(), 8);
/// allocator.try_return(segment).unwrap();
/// assert_eq!(allocator.free(), 256);
/// ```
pub struct BuddySuballocator<E, T = ()> {
    shared: Arc<Shared<E, T, RawBuddy<T>>>,
}

impl<E, T> BuddySuballocator<E, T>
where
    E: 'static,
    T: Clone + Send + 'static,
{
    /// Create an allocator over `length` units of internally allocated,
    /// owned memory. `min_block_length` is rounded up to a power of two.
    pub fn new(length: usize, min_block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawBuddy::new(length, min_block_length)?;
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
        min_block_length: usize,
    ) -> Result<Self, ConfigError> {
        let raw = RawBuddy::new(length, min_block_length)?;
        let buffer = RawBuffer::borrow(base, length)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Create an allocator that takes ownership of `region`, pinning it for
    /// the allocator's lifetime.
    pub fn new_over_owned(region: Box<[E]>, min_block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawBuddy::new(region.len(), min_block_length)?;
        let buffer = RawBuffer::adopt(region)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// The effective minimum block length in units (after power-of-two
    /// rounding).
    pub fn min_block_length(&self) -> usize {
        self.shared.with_raw(|raw| raw.min_block_length())
    }

    /// An upper bound on the buffer length needed to hold `count`
    /// simultaneous power-of-two-rounded rents without failing from
    /// external fragmentation (Cholleti's bound).
    pub fn safe_length_for(count: usize) -> usize {
        match count {
            0 => 0,
            _ => count * (count.ilog2() as usize + 1) / 2,
        }
    }
}

impl_suballocator!(BuddySuballocator);
