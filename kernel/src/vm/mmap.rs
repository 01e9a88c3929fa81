//! Memory-mapped files.
//!
//! A mapping covers a whole file, one lazily loaded page per file page,
//! each holding its own privately reopened handle. Unmapping writes
//! modified pages back to their spans of the file: resident pages only
//! if their dirty bit is set, swapped-out pages unconditionally, since
//! the swap copy is the freshest version of a page whose dirty bit was
//! consumed by eviction. Pages that never left `InFilesystem` state are
//! untouched on disk and need no write at all. Only the recorded
//! `read_bytes` of each page are written, so a mapping never grows the
//! file to a page boundary.

use alloc::boxed::Box;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr, PAGE_FRAME_SIZE};

use crate::fs::{self, FileHandle, FileSystem};
use crate::paging::PageDir;
use crate::Pid;

use super::page::{AddressSpace, PageState};
use super::{Result, Vm, VmError};

impl<P: PageDir + Default, F: FileSystem> Vm<P, F> {
    /// Maps all of `file` at `addr`. Returns the mapping's length in
    /// pages. No frames are consumed until the pages fault in.
    pub fn map_file(&self, pid: Pid, addr: usize, file: FileHandle) -> Result<usize> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::BadAddress);
        }
        let len = self.fs.lock().length(file)?;
        let len = usize::try_from(len).map_err(|_| VmError::BadSpan)?;
        if len == 0 {
            return Err(VmError::EmptyMapping);
        }
        let pages = len.div_ceil(PAGE_FRAME_SIZE);
        let end = pages
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|span| addr.checked_add(span))
            .ok_or(VmError::BadAddress)?;
        if !is_user_vaddr(end - 1) {
            return Err(VmError::BadAddress);
        }

        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        // Refuse the whole mapping before recording any page of it.
        for i in 0..pages {
            if space.contains(addr + i * PAGE_FRAME_SIZE) {
                return Err(VmError::PageExists);
            }
        }

        let mut fs = self.fs.lock();
        for i in 0..pages {
            let upage = addr + i * PAGE_FRAME_SIZE;
            let read_bytes = (len - i * PAGE_FRAME_SIZE).min(PAGE_FRAME_SIZE);
            let zero_bytes = PAGE_FRAME_SIZE - read_bytes;
            let offset = (i * PAGE_FRAME_SIZE) as u64;
            if let Err(e) = Self::insert_lazy_page(
                space, &mut fs, upage, file, offset, read_bytes, zero_bytes, true,
            ) {
                // Unwind the pages recorded so far; the mapping never
                // happened.
                for j in 0..i {
                    if let Some(page) = space.remove(addr + j * PAGE_FRAME_SIZE) {
                        if let Some(origin) = page.origin {
                            fs.close(origin.handle);
                        }
                    }
                }
                return Err(e);
            }
        }
        space.mappings.insert(addr, pages);
        Ok(pages)
    }

    /// Removes the mapping that starts at `addr`, writing modified pages
    /// back to the file and releasing every page of the mapping.
    pub fn unmap_file(&self, pid: Pid, addr: usize) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        let pages = space
            .mappings
            .remove(&addr)
            .ok_or(VmError::UnknownMapping)?;
        for i in 0..pages {
            let upage = addr + i * PAGE_FRAME_SIZE;
            self.write_back(space, upage)?;
            self.release_entry(space, upage)?;
        }
        Ok(())
    }

    /// Writes a mapped page's current bytes to its span of the file if
    /// they may differ from what is on disk.
    fn write_back(&self, space: &mut AddressSpace<P>, upage: usize) -> Result<()> {
        let Some(page) = space.get(upage) else {
            // Freed individually before the unmap; nothing left to save.
            return Ok(());
        };
        let Some(origin) = page.origin else {
            return Ok(());
        };
        match page.state {
            PageState::InMemory { frame } if space.page_dir.is_dirty(upage) => {
                let frames = self.frames.lock();
                let bytes = frames.frame_bytes(frame);
                let written = self
                    .fs
                    .lock()
                    .write(origin.handle, origin.offset, &bytes[..origin.read_bytes])?;
                if written != origin.read_bytes {
                    return Err(VmError::Fs(fs::Error::Io));
                }
            }
            PageState::InSwap { slot } => {
                let mut buf = Box::new([0u8; PAGE_FRAME_SIZE]);
                self.swap.lock().read_slot(slot, &mut buf)?;
                let written = self
                    .fs
                    .lock()
                    .write(origin.handle, origin.offset, &buf[..origin.read_bytes])?;
                if written != origin.read_bytes {
                    return Err(VmError::Fs(fs::Error::Io));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::super::{FaultOutcome, PageState, VmError};
    use super::*;
    use crate::fs::MemFs;
    use alloc::vec::Vec;

    const MAP: usize = 0x2000_0000;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[test]
    fn mapping_is_lazy_and_covers_the_whole_file() {
        let mut fs = MemFs::new();
        let contents = patterned(2 * PAGE_FRAME_SIZE + 300);
        let file = fs.create(&contents);
        let vm = boot(4, 4, fs);

        assert_eq!(vm.map_file(PID, MAP, file), Ok(3));
        assert_eq!(vm.free_frames(), 4, "mapping must not consume frames");
        for i in 0..3 {
            assert_eq!(
                vm.page_state(PID, MAP + i * PAGE_FRAME_SIZE),
                Some(PageState::InFilesystem)
            );
        }

        // The partial last page reads its 300 bytes and zero-fills.
        let last = MAP + 2 * PAGE_FRAME_SIZE;
        assert_eq!(vm.resolve_fault(PID, last, false, 0), FaultOutcome::Loaded);
        assert_eq!(user_byte(&vm, PID, last), contents[2 * PAGE_FRAME_SIZE]);
        assert_eq!(
            user_byte(&vm, PID, last + 299),
            contents[2 * PAGE_FRAME_SIZE + 299]
        );
        assert_eq!(user_byte(&vm, PID, last + 300), 0);
        assert_eq!(user_byte(&vm, PID, last + PAGE_FRAME_SIZE - 1), 0);
    }

    #[test]
    fn map_file_rejects_bad_requests_atomically() {
        let mut fs = MemFs::new();
        let file = fs.create(&patterned(2 * PAGE_FRAME_SIZE));
        let empty = fs.create(b"");
        let vm = boot(4, 4, fs);

        assert_eq!(vm.map_file(PID, 0, file), Err(VmError::BadAddress));
        assert_eq!(vm.map_file(PID, MAP + 7, file), Err(VmError::BadAddress));
        assert_eq!(vm.map_file(PID, MAP, empty), Err(VmError::EmptyMapping));

        // A page in the middle of the would-be mapping is taken; nothing
        // of the mapping may be recorded.
        vm.record_lazy_segment(PID, MAP + PAGE_FRAME_SIZE, file, 0, PAGE_FRAME_SIZE, 0, true)
            .unwrap();
        assert_eq!(vm.map_file(PID, MAP, file), Err(VmError::PageExists));
        assert!(!vm.page_exists(PID, MAP));
        assert_eq!(vm.unmap_file(PID, MAP), Err(VmError::UnknownMapping));
        // Only the creator's handle and the one lazy page remain open.
        assert_eq!(vm.with_fs(|fs| fs.open_count(file)), 2);
    }

    #[test]
    fn dirty_pages_write_back_on_unmap() {
        let mut fs = MemFs::new();
        let contents = patterned(2 * PAGE_FRAME_SIZE);
        let file = fs.create(&contents);
        let vm = boot(4, 4, fs);
        vm.map_file(PID, MAP, file).unwrap();

        // Page 0 is written; page 1 is only read.
        assert_eq!(vm.resolve_fault(PID, MAP, true, 0), FaultOutcome::Loaded);
        write_user_bytes(&vm, PID, MAP + 10, b"dirty bytes");
        assert_eq!(
            vm.resolve_fault(PID, MAP + PAGE_FRAME_SIZE, false, 0),
            FaultOutcome::Loaded
        );

        vm.unmap_file(PID, MAP).unwrap();

        vm.with_fs(|fs| {
            let now = fs.contents(file).to_vec();
            assert_eq!(&now[10..21], b"dirty bytes");
            assert_eq!(now[..10], contents[..10]);
            assert_eq!(now[21..], contents[21..], "clean spans stay intact");
        });
        assert!(!vm.page_exists(PID, MAP));
        assert!(!vm.page_exists(PID, MAP + PAGE_FRAME_SIZE));
        assert_eq!(vm.free_frames(), 4);
        assert_eq!(vm.with_fs(|fs| fs.open_count(file)), 1);
    }

    #[test]
    fn swapped_mapped_page_writes_back_from_its_slot() {
        let mut fs = MemFs::new();
        let contents = patterned(PAGE_FRAME_SIZE);
        let file = fs.create(&contents);
        let vm = boot(1, 4, fs);
        vm.map_file(PID, MAP, file).unwrap();

        assert_eq!(vm.resolve_fault(PID, MAP, true, 0), FaultOutcome::Loaded);
        write_user_bytes(&vm, PID, MAP, &[0xEE; 32]);

        // The dirty mapped page loses its frame to a stack page and goes
        // to swap.
        vm.alloc_stack_page(PID).unwrap();
        assert!(matches!(vm.page_state(PID, MAP), Some(PageState::InSwap { .. })));
        assert_eq!(vm.swap_slots_in_use(), 1);

        vm.unmap_file(PID, MAP).unwrap();
        vm.with_fs(|fs| {
            assert_eq!(&fs.contents(file)[..32], &[0xEE; 32]);
            assert_eq!(fs.contents(file)[32..], contents[32..]);
        });
        assert_eq!(vm.swap_slots_in_use(), 0, "unmap released the slot");
    }

    #[test]
    fn partial_last_page_write_back_keeps_file_length() {
        let mut fs = MemFs::new();
        let file = fs.create(&patterned(300));
        let vm = boot(2, 2, fs);
        vm.map_file(PID, MAP, file).unwrap();

        assert_eq!(vm.resolve_fault(PID, MAP, true, 0), FaultOutcome::Loaded);
        write_user_bytes(&vm, PID, MAP + 5, &[9]);

        vm.unmap_file(PID, MAP).unwrap();
        vm.with_fs(|fs| {
            assert_eq!(fs.contents(file).len(), 300, "write-back must not grow the file");
            assert_eq!(fs.contents(file)[5], 9);
        });
    }

    #[test]
    fn clean_unmap_leaves_the_file_untouched() {
        let mut fs = MemFs::new();
        let contents = patterned(PAGE_FRAME_SIZE + 100);
        let file = fs.create(&contents);
        let vm = boot(2, 2, fs);
        vm.map_file(PID, MAP, file).unwrap();

        // Touch one page read-only; leave the other entirely lazy.
        assert_eq!(vm.resolve_fault(PID, MAP, false, 0), FaultOutcome::Loaded);

        vm.unmap_file(PID, MAP).unwrap();
        vm.with_fs(|fs| assert_eq!(fs.contents(file), &contents[..]));
        assert_eq!(vm.with_fs(|fs| fs.open_count(file)), 1);
    }
}
