//! Aligned IO buffers
//!
//! O_DIRECT needs sector-aligned buffers and `vmsplice` page gifting needs
//! whole, page-aligned pages. [`AlignedBuffer`] covers both.

use anyhow::{Context, Result};
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// System page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as usize
    } else {
        4096
    }
}

/// Round `len` up to a multiple of `align` (a power of two)
#[inline]
pub fn round_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Zero-initialised, heap-allocated buffer with a fixed alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Create a new aligned buffer with the specified size and alignment
    ///
    /// # Arguments
    /// * `size` - Size of the buffer in bytes
    /// * `alignment` - Alignment requirement (typically 512 or 4096)
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer size must be greater than 0");
        }
        let layout = Layout::from_size_align(size, alignment)
            .with_context(|| format!("Invalid buffer layout: size={}, alignment={}", size, alignment))?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };

        Ok(Self { ptr, size, layout })
    }

    /// Buffer made of whole pages, page aligned
    pub fn page_aligned(size: usize) -> Result<Self> {
        let page = page_size();
        Self::new(round_up(size.max(1), page), page)
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size initialised bytes for our lifetime
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and we hold &mut self
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    #[inline(always)]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % self.layout.align() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// AlignedBuffer is Send because it owns its memory
unsafe impl Send for AlignedBuffer {}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_creation() {
        let buffer = AlignedBuffer::new(4096, 512).unwrap();
        assert_eq!(buffer.size(), 4096);
        assert_eq!(buffer.alignment(), 512);
        assert!(buffer.is_aligned());
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_alignment() {
        assert!(AlignedBuffer::new(4096, 513).is_err());
        assert!(AlignedBuffer::new(0, 512).is_err());
    }

    #[test]
    fn test_page_aligned_rounds_up() {
        let page = page_size();
        let buffer = AlignedBuffer::page_aligned(page + 1).unwrap();
        assert_eq!(buffer.size(), 2 * page);
        assert_eq!(buffer.alignment(), page);
        assert!(buffer.is_aligned());
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 512), 4608);
    }
}
