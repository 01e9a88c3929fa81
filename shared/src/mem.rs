use crate::sizes::KB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Rounds `addr` down to the start of the page containing it.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_FRAME_SIZE - 1) & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_FRAME_SIZE - 1) == 0
}

/// True iff `addr` falls in the user half of the address space.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
