//! Per-process page tables.
//!
//! [`PageDirectory`] is a software two-level page table: it records the
//! mappings the paging hardware would walk, along with the accessed and
//! dirty bits the hardware would maintain. The virtual-memory layer only
//! drives it through the [`PageDir`] trait, which keeps the fault and
//! eviction paths independent of any particular MMU.

use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::u52;
use bitbybit::bitfield;
use marrowos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// Entries per second-level table. Each table covers 2MB of address space.
const PTES_PER_TABLE: usize = 512;
const TABLE_SHIFT: usize = 21;

#[bitfield(u64, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    writable: bool,
    #[bit(2, rw)]
    user: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    // Wide enough to hold frame numbers on 64-bit hosts.
    #[bits(12..=63, rw)]
    frame_number: u52,
}

/// The page-table operations the virtual-memory layer relies on.
///
/// Everything the fault resolver and frame eviction need from a process's
/// page table goes through here: installing and clearing translations, and
/// reading the hardware-maintained accessed and dirty bits.
pub trait PageDir {
    /// Maps `upage` to the physical frame at `frame_addr`.
    ///
    /// Returns false without changing anything if `upage` already has a
    /// present translation.
    fn install(&mut self, upage: usize, frame_addr: usize, writable: bool) -> bool;

    /// Removes the translation for `upage`, if any. Subsequent accesses
    /// to the page fault.
    fn clear(&mut self, upage: usize);

    /// Physical address `vaddr` currently translates to, or `None` if the
    /// page is not present.
    fn physical_addr(&self, vaddr: usize) -> Option<usize>;

    /// Whether `upage` has been written since it was installed.
    fn is_dirty(&self, upage: usize) -> bool;

    /// Whether `upage` has been read or written since the accessed bit
    /// was last cleared.
    fn is_accessed(&self, upage: usize) -> bool;

    /// Clears the accessed bit for `upage`.
    fn clear_accessed(&mut self, upage: usize);
}

/// Software rendition of a two-level page table.
#[derive(Default)]
pub struct PageDirectory {
    tables: BTreeMap<usize, Box<[PageTableEntry; PTES_PER_TABLE]>>,
}

fn pte_index(vaddr: usize) -> usize {
    (vaddr / PAGE_FRAME_SIZE) % PTES_PER_TABLE
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.tables
            .get(&(vaddr >> TABLE_SHIFT))
            .map(|table| table[pte_index(vaddr)])
    }

    /// Updates the entry for `vaddr` in place. Missing or non-present
    /// entries are left untouched.
    fn update(&mut self, vaddr: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(table) = self.tables.get_mut(&(vaddr >> TABLE_SHIFT)) {
            let entry = &mut table[pte_index(vaddr)];
            if entry.present() {
                *entry = f(*entry);
            }
        }
    }

    /// Marks `upage` accessed, as the MMU would on a load or store.
    pub fn set_accessed(&mut self, upage: usize) {
        self.update(upage, |e| e.with_accessed(true));
    }

    /// Marks `upage` accessed and dirty, as the MMU would on a store.
    pub fn set_dirty(&mut self, upage: usize) {
        self.update(upage, |e| e.with_accessed(true).with_dirty(true));
    }
}

impl PageDir for PageDirectory {
    fn install(&mut self, upage: usize, frame_addr: usize, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        debug_assert!(is_page_aligned(frame_addr));
        let table = self
            .tables
            .entry(upage >> TABLE_SHIFT)
            .or_insert_with(|| Box::new([PageTableEntry::DEFAULT; PTES_PER_TABLE]));
        let entry = &mut table[pte_index(upage)];
        if entry.present() {
            return false;
        }
        *entry = PageTableEntry::DEFAULT
            .with_present(true)
            .with_writable(writable)
            .with_user(true)
            .with_frame_number(u52::new((frame_addr as u64) >> 12));
        true
    }

    fn clear(&mut self, upage: usize) {
        debug_assert!(is_page_aligned(upage));
        if let Some(table) = self.tables.get_mut(&(upage >> TABLE_SHIFT)) {
            table[pte_index(upage)] = PageTableEntry::DEFAULT;
        }
    }

    fn physical_addr(&self, vaddr: usize) -> Option<usize> {
        let entry = self.entry(vaddr)?;
        if !entry.present() {
            return None;
        }
        let base = (entry.frame_number().value() as usize) << 12;
        Some(base + vaddr % PAGE_FRAME_SIZE)
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|e| e.present() && e.dirty())
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage)
            .is_some_and(|e| e.present() && e.accessed())
    }

    fn clear_accessed(&mut self, upage: usize) {
        self.update(upage, |e| e.with_accessed(false));
    }
}
