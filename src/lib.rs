//! Suballocators for a single pinned, contiguous buffer
//!
//! This crate carves one large region of memory into smaller
//! variable-length segments that callers *rent* and later *return*. The
//! buffer itself never moves and never grows; the allocators only track
//! which parts of it are free, satisfy a rent in bounded time, and merge
//! returned space back together so it stays rentable.
//!
//! Three allocators cover three fragmentation/latency trade-offs:
//!
//! * [`BuddySuballocator`] — power-of-two blocks in an implicit buddy
//!   tree. Rent and return are `O(log n)`; segment lengths round up to a
//!   power of two of the minimum block.
//! * [`SequentialSuballocator`] — equal blocks, a rotating cursor, and a
//!   linear scan that coalesces free neighbors lazily while it searches.
//!   Return is `O(1)`.
//! * [`DirectionalSuballocator`] — equal blocks scanned in whichever
//!   direction of the cursor currently holds more free space, with eager
//!   two-way coalescing on return.
//!
//! # Renting and returning
//! A rent yields a [`Segment`]: a value-sized descriptor of the rented
//! region. Walking through the life of a 32-unit buffer with 1-unit
//! blocks:
//! 1.  Freshly constructed, one free run spans everything.
//!     ```text
//!     ································  free = 32
//!     ```
//! 2.  `try_rent(12, ())` carves the run's head.
//!     ```text
//!     aaaaaaaaaaaa····················  used = 12
//!     ```
//! 3.  Two more rents of 8 and 4.
//!     ```text
//!     aaaaaaaaaaaabbbbbbbbcccc········  used = 24
//!     ```
//! 4.  Segment `b` is returned; its space is free again but fragmented
//!     between `a` and `c`.
//!     ```text
//!     aaaaaaaaaaaa········cccc········  used = 16
//!     ```
//! 5.  A rent of 10 only fits at the tail; a later rent of 8 reuses the
//!     hole once the allocator's coalescing (lazy or eager, depending on
//!     the kind) has merged whatever neighbors it can.
//!     ```text
//!     aaaaaaaaaaaaddddddddcccceeeeee··
//!     ```
//! 6.  Returning everything restores a single free run; `clear()` gets
//!     there in one call (outstanding segments then must not be touched).
//!
//! The buffer is supplied in one of three ways: allocated internally
//! (`new`), borrowed from the caller (`new_over`, unsafe: the caller keeps
//! it alive), or adopted from a caller's boxed region (`new_over_owned`).
//!
//! Segment contents are raw storage. The allocators never read, write or
//! drop elements; the `unsafe` accessors on [`Segment`] hand out views
//! whose soundness rides on "only touch what you rented, only while
//! rented".
//!
//! # Finding a segment's allocator
//! Segments are value types without back-references. The process-wide
//! [`registry`] maps each live allocator's buffer base address to its
//! owner, which is what [`Segment::try_release`] and the return-on-drop
//! guard [`ScopedSegment`] use. Dropped allocators simply stop resolving.
//!
//! # Observing mutation
//! Two optional trackers consume segment events. The
//! [`FragmentationTracker`](trackers::FragmentationTracker) maps rented
//! segments into fixed-width buckets and flags tags stranded in
//! sparsely-filled neighborhoods. The
//! [`UpdateWindowTracker`](trackers::UpdateWindowTracker) compresses a log
//! of rent/update/return events into a minimal list of disjoint byte
//! windows — the change set a downstream copy-out wants.
//!
//! # Concurrency
//! One allocator instance is single-threaded: callers serialize all
//! operations on it (the internal lock only makes the handle shareable
//! and keeps the registry path safe, it is not a concurrency feature).
//! Only the registry tolerates true parallelism, so allocators may be
//! constructed and dropped concurrently with each other.
//!
//! # Quick start
//! ```
//! use suballoc::{SequentialSuballocator, Suballocator};
//!
//! let allocator = SequentialSuballocator::<u32>::new(1024, 16).unwrap();
//! let mut segment = allocator.try_rent(100, ()).unwrap();
//! assert!(segment.len() >= 100);
//!
//! // SAFETY: the segment is rented and exclusively held.
//! unsafe {
//!     for index in 0..segment.len() {
//!         segment.write(index, 7);
//!     }
//! }
//!
//! assert_eq!(allocator.allocations(), 1);
//! allocator.try_return(segment).unwrap();
//! assert_eq!(allocator.free(), 1024);
//! ```

#![no_std]

extern crate alloc;

mod buddy;
mod buffer;
pub mod collections;
mod directional;
mod error;
mod range_map;
pub mod registry;
mod segment;
mod sequential;
mod suballocator;
pub mod trackers;

pub use buddy::BuddySuballocator;
pub use directional::{DirectionalSuballocator, DEFAULT_DIRECTION_BIAS};
pub use error::{ConfigError, EmptyCollection, MapError, RentError, ReturnError};
pub use range_map::{BucketStats, Nearest, NearestGe, NearestLe, RangeBucketMap, RangeEntry};
pub use segment::{ScopedSegment, Segment};
pub use sequential::SequentialSuballocator;
pub use suballocator::{SegmentIter, Suballocator};
