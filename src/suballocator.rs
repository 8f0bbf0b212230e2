//! The common frame around the three allocator cores.
//!
//! Each allocator is split the same way: a raw core owning the index
//! arithmetic behind `&mut self`, and a public handle that wraps the core
//! in a `spin::Mutex` next to the buffer and the registry registration.
//! The raw cores work purely in unit offsets; pointers appear only at this
//! layer, when a [`Segment`] is materialized against the buffer base.

use crate::buffer::RawBuffer;
use crate::error::{ConfigError, RentError, ReturnError};
use crate::registry::{self, SegmentHome};
use crate::segment::Segment;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use spin::Mutex;

/// A rented run as the raw cores see it: a unit offset and a unit length
/// within the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawSegment {
    pub offset: usize,
    pub length: usize,
}

/// The single-threaded algorithm core of one allocator kind.
///
/// All quantities are buffer units; the implementation never sees a
/// pointer. `restore` must validate the run before mutating anything and
/// hand back the tag stored at rent time.
pub(crate) trait RawSuballocator<T: Clone> {
    /// Configured buffer length in units.
    fn length(&self) -> usize;

    /// Units currently rented out.
    fn used(&self) -> usize;

    /// Count of outstanding segments.
    fn allocations(&self) -> usize;

    fn rent(&mut self, length: usize, tag: T) -> Result<RawSegment, RentError>;

    fn restore(&mut self, offset: usize, length: usize) -> Result<T, ReturnError>;

    fn clear(&mut self);

    /// Append every occupied run, ascending by offset.
    fn snapshot(&self, out: &mut Vec<(RawSegment, T)>);
}

/// Buffer + locked core + registry identity, shared between the public
/// handle and any scoped-segment guards resolving through the registry.
pub(crate) struct Shared<E, T, R> {
    buffer: RawBuffer<E>,
    raw: Mutex<R>,
    _tag: PhantomData<fn() -> T>,
}

// SAFETY: the buffer base is an address the allocator itself never
// dereferences; all index state sits behind the `raw` lock and moves with
// its tags. Element access through segments is unsafe and caller-owned.
unsafe impl<E, T, R: Send> Send for Shared<E, T, R> {}
unsafe impl<E, T, R: Send> Sync for Shared<E, T, R> {}

impl<E, T, R> Shared<E, T, R>
where
    T: Clone + Send + 'static,
    R: RawSuballocator<T> + Send + 'static,
    E: 'static,
{
    /// Wrap a validated core and buffer, and claim the buffer base in the
    /// registry.
    pub(crate) fn create(buffer: RawBuffer<E>, raw: R) -> Result<Arc<Self>, ConfigError> {
        let base = buffer.base_addr();
        let shared = Arc::new(Self { buffer, raw: Mutex::new(raw), _tag: PhantomData });
        let weak: Weak<Self> = Arc::downgrade(&shared);
        registry::register(base, weak, Arc::as_ptr(&shared) as *const () as usize)?;
        log::debug!(
            "registered suballocator at {base:#x} over {} units of {} bytes",
            shared.buffer.len(),
            mem::size_of::<E>(),
        );
        Ok(shared)
    }

    pub(crate) fn length(&self) -> usize {
        self.raw.lock().length()
    }

    pub(crate) fn used(&self) -> usize {
        self.raw.lock().used()
    }

    pub(crate) fn allocations(&self) -> usize {
        self.raw.lock().allocations()
    }

    pub(crate) fn buffer_ptr(&self) -> NonNull<E> {
        self.buffer.base()
    }

    pub(crate) fn try_rent(&self, length: usize, tag: T) -> Result<Segment<E, T>, RentError> {
        let raw_segment = self.raw.lock().rent(length, tag.clone())?;
        log::trace!(
            "rented {} units at offset {} from {:#x}",
            raw_segment.length,
            raw_segment.offset,
            self.buffer.base_addr(),
        );
        Ok(self.materialize(raw_segment, tag))
    }

    pub(crate) fn try_return(&self, segment: Segment<E, T>) -> Result<(), ReturnError> {
        if segment.buffer_ptr() != self.buffer.base() {
            return Err(ReturnError::UnknownSegment);
        }
        let offset = segment.offset();
        let length = segment.len();
        self.raw.lock().restore(offset, length)?;
        log::trace!(
            "returned {length} units at offset {offset} to {:#x}",
            self.buffer.base_addr(),
        );
        Ok(())
    }

    pub(crate) fn clear(&self) {
        self.raw.lock().clear();
        log::debug!("cleared suballocator at {:#x}", self.buffer.base_addr());
    }

    /// Snapshot the occupied segments. The snapshot is taken under the lock
    /// and stays valid however the allocator mutates afterwards.
    pub(crate) fn segments(&self) -> Vec<Segment<E, T>> {
        let mut runs = Vec::new();
        self.raw.lock().snapshot(&mut runs);
        runs.into_iter()
            .map(|(raw_segment, tag)| self.materialize(raw_segment, tag))
            .collect()
    }

    /// Run a closure against the locked core; used by the handles for
    /// kind-specific accessors and knobs.
    pub(crate) fn with_raw<F, U>(&self, f: F) -> U
    where
        F: FnOnce(&mut R) -> U,
    {
        f(&mut self.raw.lock())
    }

    fn materialize(&self, raw_segment: RawSegment, tag: T) -> Segment<E, T> {
        // SAFETY: the core only yields runs inside `[0, length)`, so the
        // offset stays within the buffer allocation.
        let ptr = unsafe {
            NonNull::new_unchecked(self.buffer.base().as_ptr().add(raw_segment.offset))
        };
        Segment::new(self.buffer.base(), ptr, raw_segment.length, tag)
    }
}

impl<E, T, R> SegmentHome for Shared<E, T, R>
where
    T: Clone + Send + 'static,
    R: RawSuballocator<T> + Send + 'static,
    E: 'static,
{
    fn element_size(&self) -> usize {
        mem::size_of::<E>()
    }

    fn restore_units(&self, offset: usize, length: usize) -> Result<(), ReturnError> {
        self.raw.lock().restore(offset, length).map(drop)
    }
}

impl<E, T, R> Drop for Shared<E, T, R> {
    fn drop(&mut self) {
        registry::deregister(self.buffer.base_addr(), self as *const Self as *const () as usize);
        log::debug!("deregistered suballocator at {:#x}", self.buffer.base_addr());
    }
}

/// Snapshot iterator over an allocator's occupied segments.
///
/// Yielded in ascending buffer order; the snapshot is detached, so the
/// allocator may be mutated while iterating (the iterator keeps describing
/// the state it was taken in).
pub struct SegmentIter<E, T> {
    inner: alloc::vec::IntoIter<Segment<E, T>>,
}

impl<E, T> SegmentIter<E, T> {
    pub(crate) fn new(segments: Vec<Segment<E, T>>) -> Self {
        Self { inner: segments.into_iter() }
    }
}

impl<E, T> Iterator for SegmentIter<E, T> {
    type Item = Segment<E, T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<E, T> ExactSizeIterator for SegmentIter<E, T> {}

/// The surface shared by every allocator kind.
///
/// All size accessors are in buffer units unless suffixed `_bytes`. A unit
/// is one element of `E`.
pub trait Suballocator<E, T = ()> {
    /// Total buffer capacity in units.
    fn length(&self) -> usize;

    /// Units currently rented out.
    fn used(&self) -> usize;

    /// Count of outstanding segments.
    fn allocations(&self) -> usize;

    /// Base pointer of the element buffer.
    fn buffer_ptr(&self) -> NonNull<E>;

    /// Rent a segment of at least `length` units.
    ///
    /// The segment may be longer than requested (block or power-of-two
    /// rounding); its exact length is [`Segment::len`]. On failure nothing
    /// changes and [`RentError::NoSpace`] or [`RentError::InvalidLength`]
    /// is returned as a value.
    fn try_rent(&self, length: usize, tag: T) -> Result<Segment<E, T>, RentError>;

    /// Return a rented segment. Unknown, foreign or already-returned
    /// segments are rejected with [`ReturnError::UnknownSegment`] and leave
    /// the allocator untouched.
    fn try_return(&self, segment: Segment<E, T>) -> Result<(), ReturnError>;

    /// Reset to the post-construction state. Previously rented segments
    /// must not be touched afterwards — same consequence as disposal.
    fn clear(&self);

    /// Enumerate the currently occupied segments, ascending by offset.
    fn iter(&self) -> SegmentIter<E, T>;

    /// Free capacity in units.
    fn free(&self) -> usize {
        self.length() - self.used()
    }

    /// Total buffer capacity in bytes.
    fn length_bytes(&self) -> usize {
        self.length() * mem::size_of::<E>()
    }

    /// Rented-out capacity in bytes.
    fn used_bytes(&self) -> usize {
        self.used() * mem::size_of::<E>()
    }

    /// Free capacity in bytes.
    fn free_bytes(&self) -> usize {
        self.free() * mem::size_of::<E>()
    }

    /// Rent, translating failure into a panic.
    ///
    /// # Panics
    /// Panics where [`try_rent`](Self::try_rent) would return an error.
    fn rent(&self, length: usize, tag: T) -> Segment<E, T> {
        match self.try_rent(length, tag) {
            Ok(segment) => segment,
            Err(error) => panic!("rent of {length} units failed: {error}"),
        }
    }
}

/// Implements [`Suballocator`] by delegation to the handle's `shared`
/// field. Each allocator handle is the same thin shape, so the impl is
/// mechanical.
macro_rules! impl_suballocator {
    ($handle:ident) => {
        impl<E, T> $crate::Suballocator<E, T> for $handle<E, T>
        where
            E: 'static,
            T: Clone + Send + 'static,
        {
            fn length(&self) -> usize {
                self.shared.length()
            }

            fn used(&self) -> usize {
                self.shared.used()
            }

            fn allocations(&self) -> usize {
                self.shared.allocations()
            }

            fn buffer_ptr(&self) -> core::ptr::NonNull<E> {
                self.shared.buffer_ptr()
            }

            fn try_rent(
                &self,
                length: usize,
                tag: T,
            ) -> Result<$crate::Segment<E, T>, $crate::RentError> {
                self.shared.try_rent(length, tag)
            }

            fn try_return(
                &self,
                segment: $crate::Segment<E, T>,
            ) -> Result<(), $crate::ReturnError> {
                self.shared.try_return(segment)
            }

            fn clear(&self) {
                self.shared.clear()
            }

            fn iter(&self) -> $crate::SegmentIter<E, T> {
                $crate::SegmentIter::new(self.shared.segments())
            }
        }
    };
}

pub(crate) use impl_suballocator;
