//! Optional observers of an allocator's rent, update and return events.
//!
//! Trackers are driven by the caller: feed them the segments you rent,
//! touch and return, and query them on demand. They never hold references
//! into the allocator.

mod fragmentation;
mod windows;

pub use fragmentation::FragmentationTracker;
pub use windows::{UpdateWindow, UpdateWindowTracker, UpdateWindows};
