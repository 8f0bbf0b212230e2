//! The update-window tracker.
//!
//! Records rent/update/return events against a buffer and, on demand,
//! compresses them into a short list of disjoint byte windows describing
//! everything that changed since the last [`clear`]. Downstream consumers
//! use the windows to copy out exactly the touched regions:
//!
//! ```text
//!  events:   add [0,100)   add [150,200)        min_fill_pct = 0.6
//!  combine?  (100 + 50) / (200 - 0) = 0.75 ≥ 0.6  → one window [0,200)
//!            at min_fill_pct = 0.8 they stay apart: [0,100), [150,200)
//! ```
//!
//! A rent that is returned untouched cancels out of the log entirely.
//!
//! [`clear`]: UpdateWindowTracker::clear

use crate::collections::MinHeap;
use crate::segment::Segment;

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy)]
struct WindowEvent {
    added: bool,
    base: usize,
    bytes: usize,
}

/// One contiguous byte range of the buffer that was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateWindow {
    /// Address of the first byte.
    pub base: usize,
    /// Length in bytes.
    pub len_bytes: usize,
}

impl UpdateWindow {
    /// Address one past the last byte.
    pub fn end(&self) -> usize {
        self.base + self.len_bytes
    }

    /// The window as a raw byte pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

/// The built change set: disjoint windows sorted by base, plus aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateWindows {
    /// Disjoint windows, ascending by base address.
    pub windows: Vec<UpdateWindow>,
    /// Distance from the first window's start to the last window's end.
    pub spread_bytes: usize,
    /// Summed window lengths.
    pub total_bytes: usize,
}

/// Buffers segment mutation events and builds a compressed window list.
///
/// `min_fill_pct` steers the compression: two neighboring mutations merge
/// into one window when the merged window would be at least that fraction
/// covered by them. `0.0` merges everything into one window spanning the
/// whole touched range; `1.0` merges only overlapping or exactly adjacent
/// mutations.
///
/// ```
/// use suballoc::trackers::UpdateWindowTracker;
/// use suballoc::{SequentialSuballocator, Suballocator};
///
/// let allocator = SequentialSuballocator::<u8>::new(512, 1).unwrap();
/// let mut tracker = UpdateWindowTracker::new(0.5);
///
/// let written = allocator.rent(64, ());
/// tracker.track_rental(&written);
/// let _gap = allocator.rent(384, ());
/// let transient = allocator.rent(64, ());
/// tracker.track_rental(&transient);
/// tracker.track_return(&transient);
/// allocator.try_return(transient).unwrap();
///
/// // the cancelled rent vanishes; only the kept write remains
/// let changes = tracker.build_windows();
/// assert_eq!(changes.total_bytes, 64);
/// assert_eq!(changes.windows[0].as_ptr(), written.as_ptr().cast());
/// ```
pub struct UpdateWindowTracker {
    min_fill_pct: f64,
    events: Vec<WindowEvent>,
}

impl UpdateWindowTracker {
    /// Create a tracker with the given merge threshold.
    ///
    /// # Panics
    /// Panics unless `min_fill_pct` lies in `[0, 1]`.
    pub fn new(min_fill_pct: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&min_fill_pct),
            "minimum fill percentage must lie in [0, 1]"
        );
        Self { min_fill_pct, events: Vec::new() }
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Record a freshly rented segment.
    pub fn track_rental<E, T>(&mut self, segment: &Segment<E, T>) {
        self.push(true, segment);
    }

    /// Record an in-place mutation of a rented segment.
    pub fn track_update<E, T>(&mut self, segment: &Segment<E, T>) {
        self.push(true, segment);
    }

    /// Record a returned segment.
    pub fn track_return<E, T>(&mut self, segment: &Segment<E, T>) {
        self.push(false, segment);
    }

    /// Forget every buffered event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Compress the buffered events into disjoint windows.
    ///
    /// Events are processed in stable base order. A return that exactly
    /// matches the window opened by its rent pops that window; any other
    /// event either extends the open window (when the fill ratio across
    /// the extended span stays at or above the threshold) or opens a new
    /// one.
    pub fn build_windows(&self) -> UpdateWindows {
        // (base, sequence) keys make the heap drain a stable sort
        let mut ordered = MinHeap::with_capacity(self.events.len());
        for (sequence, event) in self.events.iter().enumerate() {
            ordered.push((event.base, sequence));
        }

        let mut open: Vec<OpenWindow> = Vec::new();
        while let Ok((_, sequence)) = ordered.pop() {
            let event = self.events[sequence];
            let event_end = event.base + event.bytes;
            if !event.added {
                if let Some(top) = open.last() {
                    if top.base == event.base && top.end - top.base == event.bytes {
                        // a rent immediately undone by its return
                        open.pop();
                        continue;
                    }
                }
            }
            match open.last_mut() {
                Some(top) if Self::merges(self.min_fill_pct, top, &event) => {
                    top.end = top.end.max(event_end);
                    // overlap guard: the fill can never exceed the window
                    top.filled = (top.filled + event.bytes).min(top.end - top.base);
                }
                _ => {
                    open.push(OpenWindow { base: event.base, end: event_end, filled: event.bytes });
                }
            }
        }

        let windows: Vec<UpdateWindow> = open
            .iter()
            .map(|window| UpdateWindow { base: window.base, len_bytes: window.end - window.base })
            .collect();
        let spread_bytes = match (windows.first(), windows.last()) {
            (Some(first), Some(last)) => last.end() - first.base,
            _ => 0,
        };
        let total_bytes = windows.iter().map(|window| window.len_bytes).sum();
        UpdateWindows { windows, spread_bytes, total_bytes }
    }

    fn merges(min_fill_pct: f64, top: &OpenWindow, event: &WindowEvent) -> bool {
        let span = (event.base + event.bytes) - top.base;
        let combined = (top.end - top.base) + event.bytes;
        combined as f64 / span as f64 >= min_fill_pct
    }

    fn push<E, T>(&mut self, added: bool, segment: &Segment<E, T>) {
        self.events.push(WindowEvent {
            added,
            base: segment.as_ptr() as usize,
            bytes: segment.len_bytes(),
        });
    }
}

struct OpenWindow {
    base: usize,
    end: usize,
    filled: usize,
}

#[cfg(test)]
mod tests {
    use super::{UpdateWindow, UpdateWindowTracker};
    use crate::{SequentialSuballocator, Suballocator};
    use alloc::vec::Vec;

    /// A segment factory over one allocator so events carry real addresses.
    fn harness() -> (SequentialSuballocator<u8>, usize) {
        let allocator = SequentialSuballocator::new(1024, 1).unwrap();
        let base = allocator.buffer_ptr().as_ptr() as usize;
        (allocator, base)
    }

    #[test]
    fn adjacent_mutations_merge_when_dense_enough() {
        let (allocator, base) = harness();
        let first = allocator.rent(100, ());
        let gap = allocator.rent(50, ());
        let second = allocator.rent(50, ());

        let mut tracker = UpdateWindowTracker::new(0.6);
        tracker.track_rental(&first);
        tracker.track_rental(&second);
        // (100 + 50) / 200 = 0.75 ≥ 0.6
        let built = tracker.build_windows();
        assert_eq!(built.windows, [UpdateWindow { base, len_bytes: 200 }]);
        assert_eq!(built.spread_bytes, 200);
        assert_eq!(built.total_bytes, 200);

        let mut sparse = UpdateWindowTracker::new(0.8);
        sparse.track_rental(&first);
        sparse.track_rental(&second);
        let built = sparse.build_windows();
        assert_eq!(
            built.windows,
            [
                UpdateWindow { base, len_bytes: 100 },
                UpdateWindow { base: base + 150, len_bytes: 50 },
            ]
        );
        assert_eq!(built.spread_bytes, 200);
        assert_eq!(built.total_bytes, 150);
        drop(gap);
    }

    #[test]
    fn rent_cancelled_by_matching_return_vanishes() {
        let (allocator, base) = harness();
        let keeper = allocator.rent(10, ());
        let transient = allocator.rent(10, ());

        let mut tracker = UpdateWindowTracker::new(1.0);
        tracker.track_rental(&keeper);
        tracker.track_rental(&transient);
        tracker.track_return(&transient);
        allocator.try_return(transient).unwrap();

        let built = tracker.build_windows();
        assert_eq!(built.windows, [UpdateWindow { base, len_bytes: 10 }]);
    }

    #[test]
    fn unmatched_returns_still_mark_their_region() {
        let (allocator, base) = harness();
        let segment = allocator.rent(10, ());

        let mut tracker = UpdateWindowTracker::new(1.0);
        // the return arrives without its rent in this flush interval
        tracker.track_return(&segment);
        let built = tracker.build_windows();
        assert_eq!(built.windows, [UpdateWindow { base, len_bytes: 10 }]);
    }

    #[test]
    fn events_are_ordered_by_base_not_arrival() {
        let (allocator, base) = harness();
        let first = allocator.rent(10, ());
        let second = allocator.rent(10, ());
        let third = allocator.rent(10, ());

        let mut tracker = UpdateWindowTracker::new(0.0);
        tracker.track_update(&third);
        tracker.track_update(&first);
        tracker.track_update(&second);
        let built = tracker.build_windows();
        // threshold 0 merges everything into one span
        assert_eq!(built.windows, [UpdateWindow { base, len_bytes: 30 }]);
    }

    #[test]
    fn overlapping_updates_do_not_overcount_fill() {
        let (allocator, base) = harness();
        let mut segment = allocator.rent(100, ());

        let mut tracker = UpdateWindowTracker::new(0.9);
        tracker.track_rental(&segment);
        tracker.track_update(&segment);
        tracker.track_update(&segment);
        let built = tracker.build_windows();
        assert_eq!(built.windows, [UpdateWindow { base, len_bytes: 100 }]);
        assert_eq!(built.total_bytes, 100);
        // SAFETY: the segment is rented and exclusively held here.
        unsafe { segment.write(0, 1) };
    }

    #[test]
    fn windows_are_disjoint_and_sorted() {
        let (allocator, _) = harness();
        let mut segments = Vec::new();
        for _ in 0..8 {
            segments.push(allocator.rent(32, ()));
        }
        let mut tracker = UpdateWindowTracker::new(0.95);
        for segment in segments.iter().rev() {
            tracker.track_rental(segment);
        }
        let built = tracker.build_windows();
        assert!(!built.windows.is_empty());
        for pair in built.windows.windows(2) {
            assert!(pair[0].end() <= pair[1].base, "windows overlap or are unsorted");
        }
    }

    #[test]
    fn clear_empties_the_log() {
        let (allocator, _) = harness();
        let segment = allocator.rent(10, ());
        let mut tracker = UpdateWindowTracker::new(0.5);
        tracker.track_rental(&segment);
        assert_eq!(tracker.len(), 1);
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.build_windows().windows, []);
    }

    #[test]
    #[should_panic(expected = "must lie in [0, 1]")]
    fn threshold_is_validated() {
        UpdateWindowTracker::new(1.5);
    }
}
