//! Growable support containers consumed by the allocators and their tests.
//!
//! These are deliberately plain: fixed contracts, no iterator adaptors
//! beyond what the core needs. [`PagedVec`] backs the block indexes of the
//! scanning allocators, [`MinHeap`] orders update-window events, and the
//! rest serve the test workloads.

mod bits;
mod heap;
mod paged;
mod queue;
mod stack;

pub use bits::BitArray;
pub use heap::MinHeap;
pub use paged::PagedVec;
pub use queue::FifoQueue;
pub use stack::Stack;
