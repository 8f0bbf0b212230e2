//! The directional block suballocator.
//!
//! Like the sequential-fit allocator this scans a block index of equal
//! blocks, but each run also records the length of the run before it, so
//! the index walks in both directions. Every rent first picks a direction
//! from a running *free balance* — the count of free blocks at or after
//! the cursor minus the count below it:
//!
//! ```text
//!        behind (free: 3)      ahead (free: 9)
//!  [·····|#####|···]  ^cursor  [····|######|·········]
//!                               balance = 9 - 3 = +6 → scan forward
//! ```
//!
//! A biased sign test with a hysteresis term keeps the scan from
//! oscillating when the balance hovers near zero. Scans that hit an end
//! restore their bookkeeping and flip direction; two turnarounds mean no
//! run fits. Returns coalesce eagerly in both directions and pull the
//! cursor back to the start of the merged run so it never points into the
//! middle of free space.

use crate::buffer::RawBuffer;
use crate::collections::PagedVec;
use crate::error::{ConfigError, RentError, ReturnError};
use crate::suballocator::{impl_suballocator, RawSegment, RawSuballocator, Shared};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use hashbrown::HashMap;

/// Default hysteresis weight applied to the previous direction when the
/// sign of the free balance alone is ambiguous.
pub const DEFAULT_DIRECTION_BIAS: f64 = 0.3;

const OCCUPIED_BIT: u64 = 1 << 63;
const COUNT_BITS: u32 = 31;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
/// Largest run length representable in a 31-bit count field.
const MAX_RUN: usize = COUNT_MASK as usize;

/// Entry word layout: bit 63 occupied, bits 31..62 preceding-run length,
/// bits 0..31 run length. Meaningful only at the first block of a run.
fn pack(occupied: bool, blocks: usize, prev_blocks: usize) -> u64 {
    debug_assert!(blocks >= 1 && blocks <= MAX_RUN);
    debug_assert!(prev_blocks <= MAX_RUN);
    blocks as u64
        | (prev_blocks as u64) << COUNT_BITS
        | if occupied { OCCUPIED_BIT } else { 0 }
}

fn is_occupied(word: u64) -> bool {
    word & OCCUPIED_BIT != 0
}

fn run_blocks(word: u64) -> usize {
    (word & COUNT_MASK) as usize
}

fn prev_blocks(word: u64) -> usize {
    (word >> COUNT_BITS & COUNT_MASK) as usize
}

fn with_prev(word: u64, prev: usize) -> u64 {
    debug_assert!(prev <= MAX_RUN);
    word & !(COUNT_MASK << COUNT_BITS) | (prev as u64) << COUNT_BITS
}

/// The single-threaded directional core.
pub(crate) struct RawDirectional<T> {
    length: usize,
    block_length: usize,
    block_count: usize,
    index: PagedVec<u64>,
    tags: HashMap<usize, T>,
    cursor: usize,
    forward: bool,
    /// Free blocks at positions `>= cursor` minus free blocks below;
    /// maintained incrementally by every cursor and occupancy change.
    balance: i64,
    bias: f64,
    used: usize,
    allocations: usize,
}

impl<T: Clone> RawDirectional<T> {
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
        let mut directional = Self {
            length,
            block_length,
            block_count,
            index: PagedVec::new(block_count),
            tags: HashMap::new(),
            cursor: 0,
            forward: true,
            balance: 0,
            bias: DEFAULT_DIRECTION_BIAS,
            used: 0,
            allocations: 0,
        };
        directional.seed();
        Ok(directional)
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn free_balance(&self) -> i64 {
        self.balance
    }

    fn cursor_block(&self) -> usize {
        self.cursor
    }

    fn is_forward(&self) -> bool {
        self.forward
    }

    fn set_bias(&mut self, bias: f64) {
        self.bias = bias;
    }

    /// Cover `[0, block_count)` with free runs of at most `MAX_RUN` blocks,
    /// chained through the preceding-run lengths.
    fn seed(&mut self) {
        let mut offset = 0;
        let mut prev = 0;
        while offset < self.block_count {
            let chunk = (self.block_count - offset).min(MAX_RUN);
            self.index.set(offset, pack(false, chunk, prev));
            prev = chunk;
            offset += chunk;
        }
        self.cursor = 0;
        self.forward = true;
        self.balance = self.block_count as i64;
    }

    /// Unit length of a run, clamped to the buffer end for the run covering
    /// the partial tail block of a non-divisible buffer.
    fn run_units(&self, start_block: usize, blocks: usize) -> usize {
        let start = start_block * self.block_length;
        (blocks * self.block_length).min(self.length - start)
    }

    fn choose_direction(&mut self) {
        let balance = self.balance as f64 / self.block_count as f64;
        let momentum = if self.forward { 1.0 } else { -1.0 };
        self.forward = balance + self.bias * momentum >= 0.0;
    }

    fn set_prev(&mut self, index: usize, prev: usize) {
        let word = self.index.get(index);
        self.index.set(index, with_prev(word, prev));
    }

    /// Allocate `need` blocks at the head of the free run `[start, start +
    /// run)`; the cursor advances past the new segment.
    fn take_forward(&mut self, start: usize, run: usize, need: usize, tag: T) -> RawSegment {
        let word = self.index.get(start);
        let following = start + run;
        if run > need {
            self.index.set(start + need, pack(false, run - need, need));
            if following < self.block_count {
                self.set_prev(following, run - need);
            }
        }
        self.index.set(start, pack(true, need, prev_blocks(word)));
        self.tags.insert(start, tag);
        self.balance -= need as i64;
        self.used += self.run_units(start, need);
        self.allocations += 1;
        let segment = RawSegment {
            offset: start * self.block_length,
            length: self.run_units(start, need),
        };
        let next_cursor = start + need;
        if next_cursor == self.block_count {
            // wrapping the cursor to 0 moves every free block ahead of it
            self.cursor = 0;
            self.balance = -self.balance;
        } else {
            self.cursor = next_cursor;
        }
        segment
    }

    /// Allocate `need` blocks at the tail of the free run `[start, start +
    /// run)`; the cursor stays at the run start.
    fn take_backward(&mut self, start: usize, run: usize, need: usize, tag: T) -> RawSegment {
        let word = self.index.get(start);
        let lead = run - need;
        let target = start + lead;
        if lead > 0 {
            self.index.set(start, pack(false, lead, prev_blocks(word)));
            self.index.set(target, pack(true, need, lead));
        } else {
            self.index.set(start, pack(true, need, prev_blocks(word)));
        }
        let following = start + run;
        if following < self.block_count {
            self.set_prev(following, need);
        }
        self.tags.insert(target, tag);
        self.balance -= need as i64;
        self.used += self.run_units(target, need);
        self.allocations += 1;
        self.cursor = start;
        RawSegment {
            offset: target * self.block_length,
            length: self.run_units(target, need),
        }
    }
}

impl<T: Clone> RawSuballocator<T> for RawDirectional<T> {
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

        self.choose_direction();
        let initial_cursor = self.cursor;
        let initial_balance = self.balance;
        let mut turnarounds = 0;
        let mut index = self.cursor;
        loop {
            if self.forward {
                let word = self.index.get(index);
                let blocks = run_blocks(word);
                debug_assert!(blocks >= 1, "scan landed outside any recorded run");
                if !is_occupied(word) {
                    if blocks >= need {
                        return Ok(self.take_forward(index, blocks, need, tag));
                    }
                    // the run drops behind the advancing cursor
                    self.balance -= 2 * blocks as i64;
                }
                index += blocks;
                if index >= self.block_count {
                    turnarounds += 1;
                    if turnarounds == 2 {
                        self.balance = initial_balance;
                        return Err(RentError::NoSpace);
                    }
                    self.balance = initial_balance;
                    index = initial_cursor;
                    self.forward = false;
                }
            } else {
                let word = self.index.get(index);
                let preceding = prev_blocks(word);
                if preceding == 0 {
                    // at the start of the index
                    turnarounds += 1;
                    if turnarounds == 2 {
                        self.balance = initial_balance;
                        return Err(RentError::NoSpace);
                    }
                    self.balance = initial_balance;
                    index = initial_cursor;
                    self.forward = true;
                    continue;
                }
                let start = index - preceding;
                let word = self.index.get(start);
                let blocks = run_blocks(word);
                debug_assert_eq!(blocks, preceding, "preceding-run links must match run lengths");
                if !is_occupied(word) {
                    // the run moves ahead of the retreating cursor
                    self.balance += 2 * blocks as i64;
                    if blocks >= need {
                        return Ok(self.take_backward(start, blocks, need, tag));
                    }
                }
                index = start;
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
        self.index.set(start, pack(false, blocks, prev_blocks(word)));
        if start >= self.cursor {
            self.balance += blocks as i64;
        } else {
            self.balance -= blocks as i64;
        }
        self.used -= units;
        self.allocations -= 1;

        // absorb the free runs after, then before, capped by the count field
        let mut merged_start = start;
        let mut merged = blocks;
        loop {
            let next = merged_start + merged;
            if next >= self.block_count {
                break;
            }
            let next_word = self.index.get(next);
            if is_occupied(next_word) {
                break;
            }
            let next_blocks = run_blocks(next_word);
            if merged + next_blocks > MAX_RUN {
                break;
            }
            merged += next_blocks;
        }
        loop {
            let word = self.index.get(merged_start);
            let preceding = prev_blocks(word);
            if preceding == 0 {
                break;
            }
            let previous = merged_start - preceding;
            let previous_word = self.index.get(previous);
            if is_occupied(previous_word) {
                break;
            }
            if merged + preceding > MAX_RUN {
                break;
            }
            merged_start = previous;
            merged += preceding;
        }
        let merged_word = self.index.get(merged_start);
        self.index.set(merged_start, pack(false, merged, prev_blocks(merged_word)));
        let following = merged_start + merged;
        if following < self.block_count {
            self.set_prev(following, merged);
        }

        // a cursor strictly inside the merged run retreats to its start,
        // moving the free blocks it passes from behind to ahead
        if merged_start < self.cursor && self.cursor < merged_start + merged {
            self.balance += 2 * (self.cursor - merged_start) as i64;
            self.cursor = merged_start;
        }
        Ok(tag)
    }

    fn clear(&mut self) {
        self.index.reset();
        self.tags.clear();
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

/// A suballocator that scans its block index in whichever direction
/// currently holds more free space.
///
/// The direction heuristic biases the scan toward the side of the cursor
/// with the larger free share, with a hysteresis term
/// ([`DEFAULT_DIRECTION_BIAS`]) favoring the previous direction to avoid
/// flapping. Returns coalesce eagerly in both directions, so free space
/// near the cursor stays in large runs.
///
/// ```
/// use suballoc::{DirectionalSuballocator, Suballocator};
///
/// let allocator = DirectionalSuballocator::<u64>::new(100, 1).unwrap();
/// // a fresh allocator has every free block ahead of the cursor
/// assert_eq!(allocator.free_balance(), 100);
/// let segment = allocator.try_rent(25, ()).unwrap();
/// assert_eq!(allocator.free_balance(), 75);
/// allocator.try_return(segment).unwrap();
/// assert_eq!(allocator.free_balance(), 100);
/// ```
pub struct DirectionalSuballocator<E, T = ()> {
    shared: Arc<Shared<E, T, RawDirectional<T>>>,
}

impl<E, T> DirectionalSuballocator<E, T>
where
    E: 'static,
    T: Clone + Send + 'static,
{
    /// Create an allocator over `length` units of internally allocated,
    /// owned memory, carved into blocks of `block_length` units.
    pub fn new(length: usize, block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawDirectional::new(length, block_length)?;
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
        let raw = RawDirectional::new(length, block_length)?;
        let buffer = RawBuffer::borrow(base, length)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Create an allocator that takes ownership of `region`, pinning it for
    /// the allocator's lifetime.
    pub fn new_over_owned(region: Box<[E]>, block_length: usize) -> Result<Self, ConfigError> {
        let raw = RawDirectional::new(region.len(), block_length)?;
        let buffer = RawBuffer::adopt(region)?;
        Ok(Self { shared: Shared::create(buffer, raw)? })
    }

    /// Block length in units.
    pub fn block_length(&self) -> usize {
        self.shared.with_raw(|raw| raw.block_length())
    }

    /// Current free balance: free blocks at or after the cursor minus free
    /// blocks below it.
    pub fn free_balance(&self) -> i64 {
        self.shared.with_raw(|raw| raw.free_balance())
    }

    /// Current cursor position as a block index.
    pub fn cursor_block(&self) -> usize {
        self.shared.with_raw(|raw| raw.cursor_block())
    }

    /// Whether the last chosen scan direction was forward.
    pub fn is_forward(&self) -> bool {
        self.shared.with_raw(|raw| raw.is_forward())
    }

    /// Replace the hysteresis weight of the direction heuristic.
    pub fn set_direction_bias(&self, bias: f64) {
        self.shared.with_raw(|raw| raw.set_bias(bias));
    }
}

impl_suballocator!(DirectionalSuballocator);

#[cfg(test)]
mod tests {
    use super::{pack, prev_blocks, run_blocks, RawDirectional};
    use crate::error::{RentError, ReturnError};
    use crate::suballocator::{RawSegment, RawSuballocator};
    use alloc::vec::Vec;

    /// Recompute the balance from scratch and compare with the running
    /// counter; also assert the preceding-run links and the rule that the
    /// cursor never sits strictly inside a free run.
    fn check_invariants(directional: &RawDirectional<()>) {
        let mut balance = 0i64;
        let mut index = 0;
        let mut previous = 0;
        while index < directional.block_count {
            let word = directional.index.get(index);
            let blocks = run_blocks(word);
            assert!(blocks >= 1);
            assert_eq!(prev_blocks(word), previous, "stale preceding-run link at {index}");
            if !super::is_occupied(word) {
                if index >= directional.cursor {
                    balance += blocks as i64;
                } else {
                    assert!(
                        index + blocks <= directional.cursor,
                        "cursor inside a free run"
                    );
                    balance -= blocks as i64;
                }
            }
            previous = blocks;
            index += blocks;
        }
        assert_eq!(balance, directional.balance, "running balance drifted");
    }

    #[test]
    fn seeded_state_is_all_ahead() {
        let directional: RawDirectional<()> = RawDirectional::new(100, 1).unwrap();
        assert_eq!(directional.balance, 100);
        assert_eq!(directional.cursor, 0);
        assert!(directional.forward);
        check_invariants(&directional);
    }

    #[test]
    fn forward_rents_advance_the_cursor() {
        let mut directional: RawDirectional<()> = RawDirectional::new(100, 1).unwrap();
        let first = directional.rent(10, ()).unwrap();
        assert_eq!(first, RawSegment { offset: 0, length: 10 });
        assert_eq!(directional.cursor, 10);
        assert_eq!(directional.balance, 90);
        let second = directional.rent(10, ()).unwrap();
        assert_eq!(second.offset, 10);
        check_invariants(&directional);
    }

    #[test]
    fn freed_space_merges_behind_the_wrapped_cursor() {
        let mut directional: RawDirectional<()> = RawDirectional::new(100, 1).unwrap();
        let mut segments = Vec::new();
        for _ in 0..10 {
            segments.push(directional.rent(10, ()).unwrap());
        }
        // the exact fill wrapped the cursor to 0
        assert_eq!(directional.cursor, 0);
        for segment in &segments[..4] {
            directional.restore(segment.offset, segment.length).unwrap();
            check_invariants(&directional);
        }
        assert_eq!(directional.balance, 40);
        let segment = directional.rent(10, ()).unwrap();
        assert_eq!(segment, RawSegment { offset: 0, length: 10 });
        check_invariants(&directional);
    }

    #[test]
    fn backward_allocation_lands_at_the_tail_of_the_free_run() {
        let mut directional: RawDirectional<()> = RawDirectional::new(40, 1).unwrap();
        let a = directional.rent(10, ()).unwrap();
        let b = directional.rent(10, ()).unwrap();
        directional.rent(10, ()).unwrap();
        directional.rent(10, ()).unwrap();
        // cursor wrapped to 0; free b, then carve 5 from it forward
        directional.restore(b.offset, b.length).unwrap();
        let window = directional.rent(5, ()).unwrap();
        assert_eq!(window.offset, 10);
        assert_eq!(directional.cursor, 15);
        check_invariants(&directional);
        // free a: 10 blocks behind the cursor, 5 ahead
        directional.restore(a.offset, a.length).unwrap();
        assert_eq!(directional.balance, -5);
        check_invariants(&directional);
        // the ahead half cannot hold 8 blocks; the scan turns around and
        // carves the tail of the free run [0, 10)
        let behind = directional.rent(8, ()).unwrap();
        assert_eq!(behind, RawSegment { offset: 2, length: 8 });
        assert_eq!(directional.cursor, 0);
        check_invariants(&directional);
    }

    #[test]
    fn direction_flips_when_free_space_is_behind() {
        let mut directional: RawDirectional<()> = RawDirectional::new(100, 1).unwrap();
        let head = directional.rent(60, ()).unwrap();
        let tail = directional.rent(40, ()).unwrap();
        // cursor wrapped to 0 on the exact fill
        assert_eq!(directional.cursor, 0);
        directional.restore(head.offset, head.length).unwrap();
        check_invariants(&directional);
        assert_eq!(directional.balance, 60);
        directional.restore(tail.offset, tail.length).unwrap();
        check_invariants(&directional);
        assert_eq!(directional.balance, 100);
        // everything merged back into one run at 0
        let whole = directional.rent(100, ()).unwrap();
        assert_eq!(whole.offset, 0);
    }

    #[test]
    fn returns_coalesce_both_ways_and_repair_links() {
        let mut directional: RawDirectional<()> = RawDirectional::new(30, 1).unwrap();
        let a = directional.rent(10, ()).unwrap();
        let b = directional.rent(10, ()).unwrap();
        let c = directional.rent(10, ()).unwrap();
        directional.restore(a.offset, a.length).unwrap();
        check_invariants(&directional);
        directional.restore(c.offset, c.length).unwrap();
        check_invariants(&directional);
        // returning the middle merges all three into [0, 30)
        directional.restore(b.offset, b.length).unwrap();
        check_invariants(&directional);
        assert_eq!(directional.used(), 0);
        let whole = directional.rent(30, ()).unwrap();
        assert_eq!(whole, RawSegment { offset: 0, length: 30 });
    }

    #[test]
    fn cursor_retreats_out_of_merged_free_runs() {
        let mut directional: RawDirectional<()> = RawDirectional::new(20, 1).unwrap();
        let a = directional.rent(5, ()).unwrap();
        let b = directional.rent(5, ()).unwrap();
        assert_eq!(directional.cursor, 10);
        directional.restore(a.offset, a.length).unwrap();
        check_invariants(&directional);
        // cursor at 10 is the boundary of free [10, 20): returning b merges
        // [0, 20) and the cursor must retreat to 0
        directional.restore(b.offset, b.length).unwrap();
        assert_eq!(directional.cursor, 0);
        assert_eq!(directional.balance, 20);
        check_invariants(&directional);
    }

    #[test]
    fn no_space_after_two_turnarounds_restores_bookkeeping() {
        let mut directional: RawDirectional<()> = RawDirectional::new(10, 1).unwrap();
        let a = directional.rent(4, ()).unwrap();
        directional.rent(4, ()).unwrap();
        directional.restore(a.offset, a.length).unwrap();
        let balance = directional.balance;
        let cursor = directional.cursor;
        assert_eq!(directional.rent(7, ()), Err(RentError::NoSpace));
        assert_eq!(directional.balance, balance);
        assert_eq!(directional.cursor, cursor);
        check_invariants(&directional);
    }

    #[test]
    fn unknown_returns_are_rejected() {
        let mut directional: RawDirectional<()> = RawDirectional::new(20, 2).unwrap();
        let segment = directional.rent(6, ()).unwrap();
        assert_eq!(directional.restore(1, 6), Err(ReturnError::UnknownSegment));
        assert_eq!(directional.restore(segment.offset, 4), Err(ReturnError::UnknownSegment));
        directional.restore(segment.offset, segment.length).unwrap();
        assert_eq!(
            directional.restore(segment.offset, segment.length),
            Err(ReturnError::UnknownSegment)
        );
        check_invariants(&directional);
    }

    #[test]
    fn clear_restores_the_seeded_state() {
        let mut directional: RawDirectional<()> = RawDirectional::new(50, 1).unwrap();
        directional.rent(30, ()).unwrap();
        directional.rent(10, ()).unwrap();
        directional.clear();
        assert_eq!(directional.used(), 0);
        assert_eq!(directional.balance, 50);
        assert_eq!(directional.cursor, 0);
        check_invariants(&directional);
    }

    #[test]
    fn word_packing_roundtrips() {
        let word = pack(true, 12345, 678);
        assert!(super::is_occupied(word));
        assert_eq!(run_blocks(word), 12345);
        assert_eq!(prev_blocks(word), 678);
        let free = super::with_prev(pack(false, 7, 0), 42);
        assert!(!super::is_occupied(free));
        assert_eq!(run_blocks(free), 7);
        assert_eq!(prev_blocks(free), 42);
    }
}
