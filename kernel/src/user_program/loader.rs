//! Loads ELF executables by recording their segments for demand paging.
//!
//! Nothing of a segment is read at load time: each page of each loadable
//! segment becomes a supplemental entry remembering its span of the file,
//! and the bytes arrive when the page first faults. Only the initial
//! stack page is materialized eagerly. On failure the address space may
//! hold a partial image; the caller is expected to destroy it.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use marrowos_shared::mem::{is_user_vaddr, page_round_up, PAGE_FRAME_SIZE};

use crate::fs::{self, FileHandle, FileSystem};
use crate::paging::PageDir;
use crate::vm::fault::STACK_TOP;
use crate::vm::{Vm, VmError};
use crate::Pid;

use super::elf::{Elf, ElfProgramHeader, ElfProgramType, ElfUsage, MACHINE_X86};

/// Where a freshly loaded program begins execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
    pub entry_point: usize,
    pub stack_pointer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The file is not a 32-bit little-endian ELF image.
    BadImage,
    /// The image parses, but is not an executable for this machine.
    NotExecutable,
    /// A loadable segment failed validation.
    BadSegment(SegmentError),
    /// Recording the segments or allocating the stack failed.
    Vm(VmError),
    /// The image could not be read.
    Fs(fs::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    /// File offset and virtual address disagree modulo the page size.
    MisalignedOffset,
    /// The segment begins past the end of the file.
    OffsetPastEndOfFile,
    /// The segment claims less memory than it occupies in the file.
    ShrinksInMemory,
    /// The segment occupies no memory.
    Empty,
    /// The segment does not fit between page zero and the kernel base.
    OutsideUserRange,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadImage => write!(f, "not a 32-bit little-endian ELF image"),
            Self::NotExecutable => write!(f, "not an executable for this machine"),
            Self::BadSegment(e) => write!(f, "bad segment: {}", e),
            Self::Vm(e) => write!(f, "recording segments failed: {}", e),
            Self::Fs(e) => write!(f, "reading the image failed: {}", e),
        }
    }
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedOffset => write!(f, "file offset and virtual address misaligned"),
            Self::OffsetPastEndOfFile => write!(f, "file offset past end of file"),
            Self::ShrinksInMemory => write!(f, "memory size smaller than file size"),
            Self::Empty => write!(f, "empty segment"),
            Self::OutsideUserRange => write!(f, "segment outside the user address range"),
        }
    }
}

impl core::error::Error for LoadError {}
impl core::error::Error for SegmentError {}

impl From<VmError> for LoadError {
    fn from(e: VmError) -> Self {
        Self::Vm(e)
    }
}

impl From<fs::Error> for LoadError {
    fn from(e: fs::Error) -> Self {
        Self::Fs(e)
    }
}

impl From<SegmentError> for LoadError {
    fn from(e: SegmentError) -> Self {
        Self::BadSegment(e)
    }
}

/// Loads the executable in `file` into `pid`'s address space.
///
/// Records every loadable segment lazily, allocates the initial stack
/// page, and returns the entry point and initial stack pointer. The
/// pages keep their own reopened handles, so the caller may close
/// `file` once this returns.
pub fn load_executable<P: PageDir + Default, F: FileSystem>(
    vm: &Vm<P, F>,
    pid: Pid,
    file: FileHandle,
) -> Result<LoadedProgram, LoadError> {
    let image = vm.with_fs(|fs| -> Result<Vec<u8>, LoadError> {
        let len = fs.length(file)?;
        let len = usize::try_from(len).map_err(|_| LoadError::BadImage)?;
        let mut buf = vec![0u8; len];
        let read = fs.read(file, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    })?;

    let elf = Elf::parse_bytes(&image).map_err(|_| LoadError::BadImage)?;
    if elf.header.usage != ElfUsage::Executable || elf.header.machine != MACHINE_X86 {
        return Err(LoadError::NotExecutable);
    }

    for phdr in &elf.program_headers {
        if phdr.program_type != ElfProgramType::Load {
            continue;
        }
        validate_segment(phdr, image.len())?;
        record_segment(vm, pid, file, phdr)?;
    }

    vm.alloc_stack_page(pid)?;

    Ok(LoadedProgram {
        entry_point: elf.header.program_entry as usize,
        stack_pointer: STACK_TOP,
    })
}

fn validate_segment(phdr: &ElfProgramHeader, file_len: usize) -> Result<(), SegmentError> {
    let offset = phdr.file_offset as usize;
    let vaddr = phdr.virtual_address as usize;
    let file_size = phdr.file_size as usize;
    let memory_size = phdr.memory_size as usize;

    // The segment must sit at the same offset within a page in the file
    // and in memory, so its pages map one-to-one onto file pages.
    if offset % PAGE_FRAME_SIZE != vaddr % PAGE_FRAME_SIZE {
        return Err(SegmentError::MisalignedOffset);
    }

    if offset > file_len {
        return Err(SegmentError::OffsetPastEndOfFile);
    }

    if memory_size < file_size {
        return Err(SegmentError::ShrinksInMemory);
    }

    if memory_size == 0 {
        return Err(SegmentError::Empty);
    }

    // Both ends inside the user range, without wrapping around through
    // the kernel half.
    let end = vaddr
        .checked_add(memory_size)
        .ok_or(SegmentError::OutsideUserRange)?;
    if !is_user_vaddr(vaddr) || !is_user_vaddr(end - 1) {
        return Err(SegmentError::OutsideUserRange);
    }

    // Disallow mapping page 0, so null pointers keep faulting.
    if vaddr < PAGE_FRAME_SIZE {
        return Err(SegmentError::OutsideUserRange);
    }

    Ok(())
}

/// Records one validated segment page by page, extending it with pages
/// from the file page containing its first byte through the last page of
/// its zero fill.
fn record_segment<P: PageDir + Default, F: FileSystem>(
    vm: &Vm<P, F>,
    pid: Pid,
    file: FileHandle,
    phdr: &ElfProgramHeader,
) -> Result<(), LoadError> {
    let page_offset = phdr.virtual_address as usize % PAGE_FRAME_SIZE;
    let mut upage = phdr.virtual_address as usize - page_offset;
    let mut offset = (phdr.file_offset as usize - page_offset) as u64;
    let (mut read_bytes, mut zero_bytes) = if phdr.file_size > 0 {
        let read = page_offset + phdr.file_size as usize;
        (read, page_round_up(page_offset + phdr.memory_size as usize) - read)
    } else {
        (0, page_round_up(page_offset + phdr.memory_size as usize))
    };

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        vm.record_lazy_segment(
            pid,
            upage,
            file,
            offset,
            page_read_bytes,
            page_zero_bytes,
            phdr.writable,
        )?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_FRAME_SIZE;
        offset += PAGE_FRAME_SIZE as u64;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::elf::test_images::{header, program_header};
    use super::*;
    use crate::fs::MemFs;
    use crate::vm::test_support::*;
    use crate::vm::{FaultOutcome, KillReason, PageState};

    const TEXT: usize = 0x0804_8000;
    const ENTRY: u32 = 0x0804_8074;

    /// An image with one loadable segment whose bytes sit at file offset
    /// 0x1000, page-congruent with any page-aligned virtual address.
    fn image(vaddr: u32, data: &[u8], memsz: u32, flags: u32) -> Vec<u8> {
        let mut img = header(ENTRY, 1);
        img.extend(program_header(
            1,
            0x1000,
            vaddr,
            data.len() as u32,
            memsz,
            flags,
        ));
        img.resize(0x1000, 0);
        img.extend_from_slice(data);
        img
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn loads_lazily_with_entry_and_stack() {
        let mut fs = MemFs::new();
        let data = patterned(PAGE_FRAME_SIZE + 100);
        let file = fs.create(&image(TEXT as u32, &data, 3 * PAGE_FRAME_SIZE as u32, 5));
        let vm = boot(4, 4, fs);

        let program = load_executable(&vm, PID, file).unwrap();
        assert_eq!(program.entry_point, ENTRY as usize);
        assert_eq!(program.stack_pointer, STACK_TOP);

        // Three segment pages recorded, none loaded; only the stack page
        // holds a frame.
        for i in 0..3 {
            assert_eq!(
                vm.page_state(PID, TEXT + i * PAGE_FRAME_SIZE),
                Some(PageState::InFilesystem)
            );
        }
        assert!(matches!(
            vm.page_state(PID, STACK_TOP - PAGE_FRAME_SIZE),
            Some(PageState::InMemory { .. })
        ));
        assert_eq!(vm.free_frames(), 3);

        // Faulting the pages in reproduces the file bytes, then zeros.
        assert_eq!(vm.resolve_fault(PID, TEXT, false, 0), FaultOutcome::Loaded);
        assert_eq!(user_byte(&vm, PID, TEXT), data[0]);
        assert_eq!(
            user_byte(&vm, PID, TEXT + PAGE_FRAME_SIZE - 1),
            data[PAGE_FRAME_SIZE - 1]
        );

        let second = TEXT + PAGE_FRAME_SIZE;
        assert_eq!(vm.resolve_fault(PID, second, false, 0), FaultOutcome::Loaded);
        assert_eq!(user_byte(&vm, PID, second + 99), data[PAGE_FRAME_SIZE + 99]);
        assert_eq!(user_byte(&vm, PID, second + 100), 0);

        let third = TEXT + 2 * PAGE_FRAME_SIZE;
        assert_eq!(vm.resolve_fault(PID, third, false, 0), FaultOutcome::Loaded);
        assert_eq!(user_byte(&vm, PID, third), 0);
    }

    #[test]
    fn segment_writability_follows_its_flags() {
        let mut fs = MemFs::new();
        let data = patterned(PAGE_FRAME_SIZE);
        let ro = fs.create(&image(TEXT as u32, &data, PAGE_FRAME_SIZE as u32, 5));
        let vm = boot(4, 4, fs);
        load_executable(&vm, PID, ro).unwrap();

        assert_eq!(
            vm.resolve_fault(PID, TEXT, true, 0),
            FaultOutcome::Killed(KillReason::AccessViolation)
        );
        assert_eq!(vm.resolve_fault(PID, TEXT, false, 0), FaultOutcome::Loaded);
    }

    #[test]
    fn bss_only_segment_faults_in_zeroed_and_writable() {
        let mut fs = MemFs::new();
        // filesz == 0: nothing is read from the file at all.
        let file = fs.create(&image(TEXT as u32, &[], PAGE_FRAME_SIZE as u32, 6));
        let vm = boot(2, 2, fs);
        load_executable(&vm, PID, file).unwrap();

        assert_eq!(vm.resolve_fault(PID, TEXT, true, 0), FaultOutcome::Loaded);
        assert_eq!(user_byte(&vm, PID, TEXT), 0);
        assert_eq!(user_byte(&vm, PID, TEXT + PAGE_FRAME_SIZE - 1), 0);
    }

    #[test]
    fn rejects_garbage_and_wrong_kinds() {
        let mut fs = MemFs::new();
        let garbage = fs.create(b"#!/bin/sh\necho hi\n");
        let empty = fs.create(b"");

        let mut shared = image(TEXT as u32, &[0u8; 4], PAGE_FRAME_SIZE as u32, 5);
        shared[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        let shared = fs.create(&shared);

        let mut wrong_machine = image(TEXT as u32, &[0u8; 4], PAGE_FRAME_SIZE as u32, 5);
        wrong_machine[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
        let wrong_machine = fs.create(&wrong_machine);

        let vm = boot(2, 2, fs);
        assert_eq!(load_executable(&vm, PID, garbage), Err(LoadError::BadImage));
        assert_eq!(load_executable(&vm, PID, empty), Err(LoadError::BadImage));
        assert_eq!(
            load_executable(&vm, PID, shared),
            Err(LoadError::NotExecutable)
        );
        assert_eq!(
            load_executable(&vm, PID, wrong_machine),
            Err(LoadError::NotExecutable)
        );
    }

    #[test]
    fn rejects_invalid_segments() {
        let page = PAGE_FRAME_SIZE as u32;
        let cases: &[(u32, u32, u32, u32, SegmentError)] = &[
            // offset 0x1000 but vaddr mid-page
            (0x1000, TEXT as u32 + 0x10, 4, page, SegmentError::MisalignedOffset),
            // offset far past the image
            (0x10_0000, TEXT as u32, 4, page, SegmentError::OffsetPastEndOfFile),
            // memsz < filesz
            (0x1000, TEXT as u32, page, 8, SegmentError::ShrinksInMemory),
            // memsz == 0
            (0x1000, TEXT as u32, 0, 0, SegmentError::Empty),
            // ends in the kernel half
            (
                0x1000,
                STACK_TOP as u32 - page,
                4,
                2 * page,
                SegmentError::OutsideUserRange,
            ),
            // wraps around the top of the address space
            (0x1000, 0xFFFF_F000, 4, 0x10_0000, SegmentError::OutsideUserRange),
            // maps page zero
            (0x1000, 0x0, 4, page, SegmentError::OutsideUserRange),
        ];

        for &(offset, vaddr, filesz, memsz, expected) in cases {
            let mut fs = MemFs::new();
            let mut img = header(ENTRY, 1);
            img.extend(program_header(1, offset, vaddr, filesz, memsz, 5));
            img.resize(0x1000 + PAGE_FRAME_SIZE, 7);
            let file = fs.create(&img);
            let vm = boot(2, 2, fs);
            assert_eq!(
                load_executable(&vm, PID, file),
                Err(LoadError::BadSegment(expected)),
                "offset {:#x} vaddr {:#x}",
                offset,
                vaddr,
            );
        }
    }

    #[test]
    fn overlapping_segments_fail_and_the_space_remains_destroyable() {
        let mut fs = MemFs::new();
        let mut img = header(ENTRY, 2);
        let page = PAGE_FRAME_SIZE as u32;
        img.extend(program_header(1, 0x1000, TEXT as u32, page, page, 5));
        img.extend(program_header(1, 0x1000, TEXT as u32, page, page, 6));
        img.resize(0x1000 + PAGE_FRAME_SIZE, 9);
        let file = fs.create(&img);
        let vm = boot(2, 2, fs);

        assert_eq!(
            load_executable(&vm, PID, file),
            Err(LoadError::Vm(VmError::PageExists))
        );
        // The first segment's page is still recorded; teardown reclaims
        // it along with its file handle.
        assert!(vm.page_exists(PID, TEXT));
        vm.destroy_space(PID).unwrap();
        assert_eq!(vm.with_fs(|fs| fs.open_count(file)), 1);
    }

    #[test]
    fn non_load_segments_are_skipped() {
        let mut fs = MemFs::new();
        let mut img = header(ENTRY, 2);
        let page = PAGE_FRAME_SIZE as u32;
        // A note segment with nonsense geometry must not be validated or
        // recorded.
        img.extend(program_header(4, 0xFFFF_0000, 0x10, 0, 0, 0));
        img.extend(program_header(1, 0x1000, TEXT as u32, 8, page, 5));
        img.resize(0x1000 + 8, 3);
        let file = fs.create(&img);
        let vm = boot(2, 2, fs);

        load_executable(&vm, PID, file).unwrap();
        assert!(vm.page_exists(PID, TEXT));
        assert!(!vm.page_exists(PID, 0x10));
    }
}
