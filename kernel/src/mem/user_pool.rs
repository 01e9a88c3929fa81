//! Fixed pool of physical frames backing user pages.
//!
//! The pool hands out frame indices rather than raw pointers so that
//! bookkeeping structures (frame table, page tables) can name frames
//! without carrying pointers around. [`UserPool::frame_addr`] converts
//! an index back to the frame's physical base address.

use super::bitmap::Bitmap;
use core::ptr::NonNull;
use marrowos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// Index of a frame within the user pool.
pub type FrameId = usize;

pub struct UserPool {
    start: NonNull<u8>,
    map: Bitmap,
}

// The pool exclusively owns its memory region, so moving it between
// threads is fine; all access goes through &mut self.
unsafe impl Send for UserPool {}

impl UserPool {
    /// Builds a pool over `frames` page frames starting at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be page aligned and point to a region of at least
    /// `frames * PAGE_FRAME_SIZE` bytes that nothing else reads or
    /// writes for the lifetime of the pool.
    pub unsafe fn new(start: NonNull<u8>, frames: usize) -> Self {
        debug_assert!(is_page_aligned(start.as_ptr() as usize));
        UserPool {
            start,
            map: Bitmap::new(frames),
        }
    }

    /// Claims the lowest free frame, or `None` if the pool is full.
    ///
    /// Frames keep whatever bytes they last held. Callers that need
    /// zeroed memory clear the frame themselves.
    pub fn alloc(&mut self) -> Option<FrameId> {
        let frame = self.map.first_free()?;
        self.map.allocate(frame);
        Some(frame)
    }

    /// Returns `frame` to the pool.
    ///
    /// Panics if `frame` is not currently allocated: freeing a frame
    /// twice means the caller's bookkeeping is corrupt.
    pub fn dealloc(&mut self, frame: FrameId) {
        assert!(
            self.map.is_allocated(frame),
            "frame {} freed while not allocated",
            frame
        );
        self.map.deallocate(frame);
    }

    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.map.is_allocated(frame)
    }

    pub fn frame_count(&self) -> usize {
        self.map.len()
    }

    /// Physical base address of `frame`.
    pub fn frame_addr(&self, frame: FrameId) -> usize {
        debug_assert!(frame < self.map.len());
        self.start.as_ptr() as usize + frame * PAGE_FRAME_SIZE
    }

    /// Pointer to the first byte of `frame`.
    pub fn frame_ptr(&self, frame: FrameId) -> NonNull<u8> {
        debug_assert!(frame < self.map.len());
        // Within the region given to new, per the debug_assert above.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(frame * PAGE_FRAME_SIZE)) }
    }
}
