//! The backing buffer an allocator carves.
//!
//! A buffer is either owned (allocated here, or adopted from a caller's
//! boxed region) or borrowed (a raw pointer whose lifetime the caller
//! manages). Owned memory is released exactly once when the buffer drops;
//! borrowed memory is never touched on drop. Element values are treated as
//! raw storage throughout: the buffer neither reads nor drops `E`s.

use crate::error::ConfigError;

use alloc::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use alloc::boxed::Box;
use core::mem;
use core::ptr::NonNull;

pub(crate) struct RawBuffer<E> {
    base: NonNull<E>,
    len: usize,
    owned: bool,
}

impl<E> RawBuffer<E> {
    /// Allocate an owned buffer of `len` elements. The contents are
    /// uninitialized.
    pub(crate) fn allocate(len: usize) -> Result<Self, ConfigError> {
        let layout = Self::layout(len)?;
        // SAFETY: `layout` has a non-zero size (checked in `layout`).
        let ptr = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(ptr.cast::<E>()) else {
            handle_alloc_error(layout);
        };
        Ok(Self { base, len, owned: true })
    }

    /// Adopt a caller-supplied boxed region. The box's allocation is pinned
    /// for the buffer's lifetime and released (without dropping elements)
    /// when the buffer drops.
    pub(crate) fn adopt(region: Box<[E]>) -> Result<Self, ConfigError> {
        let len = region.len();
        Self::layout(len)?;
        // Leak the box: ownership of the allocation transfers to this
        // buffer, which deallocates by layout on drop. Element values are
        // deliberately not dropped then; segment contents are raw storage.
        let base = NonNull::new(Box::into_raw(region).cast::<E>())
            .expect("box pointers are non-null");
        Ok(Self { base, len, owned: true })
    }

    /// Borrow a caller-managed region.
    ///
    /// # Safety
    /// `base` must point to at least `len` elements of storage that stays
    /// live and unmoved for the buffer's lifetime. Alignment is checked
    /// here and reported as an error rather than assumed.
    pub(crate) unsafe fn borrow(base: NonNull<E>, len: usize) -> Result<Self, ConfigError> {
        Self::layout(len)?;
        if base.as_ptr() as usize % mem::align_of::<E>() != 0 {
            return Err(ConfigError::MisalignedBuffer);
        }
        Ok(Self { base, len, owned: false })
    }

    pub(crate) fn base(&self) -> NonNull<E> {
        self.base
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Length in elements.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn layout(len: usize) -> Result<Layout, ConfigError> {
        if mem::size_of::<E>() == 0 {
            return Err(ConfigError::ZeroSizedElement);
        }
        if len == 0 {
            return Err(ConfigError::ZeroLength);
        }
        Layout::array::<E>(len).map_err(|_| ConfigError::IndexTooLarge)
    }
}

impl<E> Drop for RawBuffer<E> {
    fn drop(&mut self) {
        if self.owned {
            // The layout was validated at construction; recomputing it here
            // cannot fail.
            if let Ok(layout) = Layout::array::<E>(self.len) {
                // SAFETY: `base` was obtained from the global allocator with
                // exactly this layout (either via `allocate` or via the
                // boxed slice adopted in `adopt`), and `owned` guarantees it
                // has not been released before.
                unsafe { dealloc(self.base.as_ptr().cast(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, NonNull, RawBuffer};
    use alloc::vec;

    #[test]
    fn allocate_rejects_zero_length() {
        assert_eq!(
            RawBuffer::<u64>::allocate(0).err(),
            Some(ConfigError::ZeroLength)
        );
    }

    #[test]
    fn allocate_rejects_zero_sized_elements() {
        assert_eq!(
            RawBuffer::<()>::allocate(16).err(),
            Some(ConfigError::ZeroSizedElement)
        );
    }

    #[test]
    fn adopt_keeps_the_region_address() {
        let region = vec![0u32; 64].into_boxed_slice();
        let addr = region.as_ptr() as usize;
        let buffer = RawBuffer::adopt(region).unwrap();
        assert_eq!(buffer.base_addr(), addr);
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn borrowed_memory_is_not_freed() {
        let mut storage = vec![0u8; 32];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        {
            // SAFETY: `storage` outlives the buffer and is not moved.
            let buffer = unsafe { RawBuffer::borrow(base, storage.len()).unwrap() };
            assert_eq!(buffer.len(), 32);
        }
        // still valid to touch after the buffer dropped
        storage[0] = 1;
        assert_eq!(storage[0], 1);
    }
}
