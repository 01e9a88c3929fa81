//! Supplemental page table.
//!
//! The hardware page table only says whether a page is present. The
//! supplemental table remembers everything else the kernel needs to
//! resolve a fault or tear a process down: where the page's bytes live
//! right now ([`PageState`]) and where they originally came from
//! ([`FileOrigin`]).

use alloc::collections::BTreeMap;
use marrowos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

use crate::fs::FileHandle;
use crate::mem::FrameId;
use crate::paging::PageDir;
use crate::vm::swap::SwapSlot;

/// File segment a page was populated from.
///
/// The handle is privately reopened for the page, so it stays valid even
/// after the process closes its own descriptor. `read_bytes` of the page
/// come from the file at `offset`; the remaining `zero_bytes` are zeros.
#[derive(Debug, Clone, Copy)]
pub struct FileOrigin {
    pub handle: FileHandle,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// Where a page's contents currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Resident in the frame with this index.
    InMemory { frame: FrameId },
    /// Not yet loaded; contents are defined by the page's [`FileOrigin`].
    InFilesystem,
    /// Evicted to the swap slot with this index.
    InSwap { slot: SwapSlot },
}

/// One user page's supplemental entry.
///
/// `origin` outlives state changes: a file-backed page keeps its origin
/// while resident and while swapped out, so a clean copy can be evicted
/// without a swap slot and a mapped file can be written back on unmap.
pub struct Page {
    pub upage: usize,
    pub writable: bool,
    pub state: PageState,
    pub origin: Option<FileOrigin>,
}

impl Page {
    /// Entry for a page that will be read from a file on first fault.
    pub fn lazy_file(upage: usize, writable: bool, origin: FileOrigin) -> Self {
        debug_assert!(is_page_aligned(upage));
        debug_assert_eq!(origin.read_bytes + origin.zero_bytes, PAGE_FRAME_SIZE);
        Page {
            upage,
            writable,
            state: PageState::InFilesystem,
            origin: Some(origin),
        }
    }

    /// Entry for a page that already sits in `frame`, such as a freshly
    /// zeroed stack page.
    pub fn resident(upage: usize, writable: bool, frame: FrameId) -> Self {
        debug_assert!(is_page_aligned(upage));
        Page {
            upage,
            writable,
            state: PageState::InMemory { frame },
            origin: None,
        }
    }
}

/// A process's supplemental page table together with its page directory.
///
/// The two structures move in lockstep: a page is present in the directory
/// exactly while its supplemental entry is [`PageState::InMemory`].
pub struct AddressSpace<P: PageDir> {
    pages: BTreeMap<usize, Page>,
    pub page_dir: P,
    /// Lowest stack page allocated so far. Starts at the stack top and
    /// moves down one page per stack allocation.
    pub(crate) stack_bottom: usize,
    /// File mappings by starting address, with their length in pages.
    pub(crate) mappings: BTreeMap<usize, usize>,
}

impl<P: PageDir + Default> Default for AddressSpace<P> {
    fn default() -> Self {
        AddressSpace {
            pages: BTreeMap::new(),
            page_dir: P::default(),
            stack_bottom: crate::vm::fault::STACK_TOP,
            mappings: BTreeMap::new(),
        }
    }
}

impl<P: PageDir> AddressSpace<P> {
    pub fn contains(&self, upage: usize) -> bool {
        self.pages.contains_key(&upage)
    }

    /// Adds `page` to the table. Fails if an entry for the same user
    /// address already exists, leaving the table unchanged.
    pub fn insert(&mut self, page: Page) -> bool {
        debug_assert!(is_page_aligned(page.upage));
        if self.pages.contains_key(&page.upage) {
            return false;
        }
        self.pages.insert(page.upage, page);
        true
    }

    pub fn get(&self, upage: usize) -> Option<&Page> {
        self.pages.get(&upage)
    }

    pub fn get_mut(&mut self, upage: usize) -> Option<&mut Page> {
        self.pages.get_mut(&upage)
    }

    pub fn remove(&mut self, upage: usize) -> Option<Page> {
        self.pages.remove(&upage)
    }

    /// User addresses of every page in the table, lowest first. Used by
    /// sweeps that need to free entries while mutating the table.
    pub fn user_addresses(&self) -> alloc::vec::Vec<usize> {
        self.pages.keys().copied().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of stack pages allocated so far.
    pub fn stack_pages(&self) -> usize {
        (crate::vm::fault::STACK_TOP - self.stack_bottom) / PAGE_FRAME_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::FileHandle;
    use crate::paging::PageDirectory;

    fn origin() -> FileOrigin {
        FileOrigin {
            handle: FileHandle { inode: 1 },
            offset: 0,
            read_bytes: PAGE_FRAME_SIZE,
            zero_bytes: 0,
        }
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut space: AddressSpace<PageDirectory> = AddressSpace::default();
        assert!(space.insert(Page::lazy_file(0x8000, true, origin())));
        assert!(!space.insert(Page::resident(0x8000, true, 0)));
        assert_eq!(space.page_count(), 1);
        assert_eq!(space.get(0x8000).unwrap().state, PageState::InFilesystem);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut space: AddressSpace<PageDirectory> = AddressSpace::default();
        space.insert(Page::resident(0x8000, true, 3));
        let page = space.remove(0x8000).unwrap();
        assert_eq!(page.state, PageState::InMemory { frame: 3 });
        assert!(!space.contains(0x8000));
        assert!(space.insert(Page::resident(0x8000, false, 4)));
    }

    #[test]
    fn user_addresses_are_sorted() {
        let mut space: AddressSpace<PageDirectory> = AddressSpace::default();
        space.insert(Page::resident(0x3000, true, 0));
        space.insert(Page::resident(0x1000, true, 1));
        space.insert(Page::resident(0x2000, true, 2));
        assert_eq!(space.user_addresses(), [0x1000, 0x2000, 0x3000]);
    }
}
