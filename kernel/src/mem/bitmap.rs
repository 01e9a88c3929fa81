//! Flat allocation bitmap, one bit per resource.

use alloc::vec;
use alloc::vec::Vec;

pub struct Bitmap {
    bits: Vec<u8>, // Each byte tracks 8 entries (1 bit per entry).
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Bitmap {
            bits: vec![0; (len + 7) / 8],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn allocate(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn deallocate(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bits[index / 8] &= !(1 << (index % 8));
    }

    /// First index whose bit is clear, scanning from zero.
    pub fn first_free(&self) -> Option<usize> {
        (0..self.len).find(|&i| !self.is_allocated(i))
    }

    pub fn count_allocated(&self) -> usize {
        (0..self.len).filter(|&i| self.is_allocated(i)).count()
    }
}
