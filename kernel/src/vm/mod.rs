//! Virtual memory management.
//!
//! Gives each process an address space larger than physical memory. A
//! page's contents live in exactly one of three places at a time: a
//! physical frame, its backing file, or a swap slot. Pages start out
//! unloaded and are materialized by the page-fault path; when the frame
//! pool runs dry, the least recently used frame is evicted, either back
//! to the filesystem (clean file-backed pages) or out to swap.
//!
//! Lock order, outermost first: address spaces, frame table, swap space,
//! filesystem. Holding a later lock while acquiring an earlier one is a
//! deadlock. The address-space lock is held across an entire fault
//! resolution, so eviction may safely rewrite another process's page
//! state and translations; the frame lock additionally covers the
//! victim's swap write, keeping the frame's bytes stable while they are
//! copied out.

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

pub use fault::{FaultOutcome, KillReason};
pub use page::{FileOrigin, Page, PageState};

use alloc::collections::BTreeMap;
use core::fmt;
use marrowos_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE,
};
use marrowos_shared::{eprintln, println};

use crate::block::block_core::Block;
use crate::fs::{self, FileHandle, FileSystem};
use crate::mem::{FrameId, UserPool};
use crate::paging::PageDir;
use crate::sync::Mutex;
use crate::Pid;

use fault::{is_stack_access, kill_reason_for};
use frame::FrameTable;
use page::AddressSpace;
use swap::{SwapError, SwapSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No address space exists for the given process.
    NoSuchProcess,
    /// An address space already exists for the given process.
    ProcessExists,
    /// A page is already recorded at the given address.
    PageExists,
    /// The address is not a page-aligned user address.
    BadAddress,
    /// Read and zero byte counts do not cover exactly one page.
    BadSpan,
    /// The file to map has no bytes.
    EmptyMapping,
    /// No file mapping starts at the given address.
    UnknownMapping,
    /// The per-process stack page limit was reached.
    StackLimit,
    /// The swap layer failed.
    Swap(SwapError),
    /// The filesystem failed.
    Fs(fs::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess => write!(f, "no address space for that process"),
            Self::ProcessExists => write!(f, "address space already exists"),
            Self::PageExists => write!(f, "a page is already recorded at that address"),
            Self::BadAddress => write!(f, "address is not a page-aligned user address"),
            Self::BadSpan => write!(f, "read and zero bytes must cover exactly one page"),
            Self::EmptyMapping => write!(f, "cannot map an empty file"),
            Self::UnknownMapping => write!(f, "no file mapping starts at that address"),
            Self::StackLimit => write!(f, "stack page limit reached"),
            Self::Swap(e) => write!(f, "swap: {}", e),
            Self::Fs(e) => write!(f, "filesystem: {}", e),
        }
    }
}

impl core::error::Error for VmError {}

impl From<SwapError> for VmError {
    fn from(e: SwapError) -> Self {
        Self::Swap(e)
    }
}

impl From<fs::Error> for VmError {
    fn from(e: fs::Error) -> Self {
        Self::Fs(e)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;

/// The virtual-memory manager.
///
/// Owns every address space, the user frame pool, the swap space, and
/// the filesystem used for lazy loading and write-back. Generic over the
/// page-table implementation so the fault and eviction paths can be
/// exercised against a software page table.
pub struct Vm<P: PageDir, F: FileSystem> {
    spaces: Mutex<BTreeMap<Pid, AddressSpace<P>>>,
    frames: Mutex<FrameTable>,
    swap: Mutex<SwapSpace>,
    fs: Mutex<F>,
}

fn kill(pid: Pid, fault_addr: usize, reason: KillReason) -> FaultOutcome {
    eprintln!("process {}: {} (fault at {:#010x})", pid, reason, fault_addr);
    FaultOutcome::Killed(reason)
}

impl<P: PageDir + Default, F: FileSystem> Vm<P, F> {
    pub fn new(pool: UserPool, swap_device: Block, fs: F) -> Self {
        let swap = SwapSpace::new(swap_device);
        println!(
            "vm: {} user frames, {} swap slots",
            pool.frame_count(),
            swap.slot_count()
        );
        Vm {
            spaces: Mutex::new(BTreeMap::new()),
            frames: Mutex::new(FrameTable::new(pool)),
            swap: Mutex::new(swap),
            fs: Mutex::new(fs),
        }
    }

    /// Creates an empty address space for `pid`.
    pub fn create_space(&self, pid: Pid) -> Result<()> {
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&pid) {
            return Err(VmError::ProcessExists);
        }
        spaces.insert(pid, AddressSpace::default());
        Ok(())
    }

    /// Tears down `pid`'s address space, releasing every frame, swap
    /// slot, and file handle its pages still hold.
    pub fn destroy_space(&self, pid: Pid) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let mut space = spaces.remove(&pid).ok_or(VmError::NoSuchProcess)?;
        for upage in space.user_addresses() {
            self.release_entry(&mut space, upage)?;
        }
        Ok(())
    }

    /// Records one page of a lazily loaded segment: `read_bytes` from
    /// `file` at `offset`, then `zero_bytes` of zeros. No frame is
    /// consumed until the page faults. The handle is privately reopened,
    /// so the caller may close its own copy.
    #[allow(clippy::too_many_arguments)]
    pub fn record_lazy_segment(
        &self,
        pid: Pid,
        upage: usize,
        file: FileHandle,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            return Err(VmError::BadAddress);
        }
        if read_bytes + zero_bytes != PAGE_FRAME_SIZE {
            return Err(VmError::BadSpan);
        }
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        if space.contains(upage) {
            return Err(VmError::PageExists);
        }
        let mut fs = self.fs.lock();
        Self::insert_lazy_page(
            space, &mut fs, upage, file, offset, read_bytes, zero_bytes, writable,
        )
    }

    /// Whether a supplemental entry covers the page containing `vaddr`.
    pub fn page_exists(&self, pid: Pid, vaddr: usize) -> bool {
        self.page_state(pid, vaddr).is_some()
    }

    /// Current backing state of the page containing `vaddr`.
    pub fn page_state(&self, pid: Pid, vaddr: usize) -> Option<PageState> {
        self.spaces
            .lock()
            .get(&pid)
            .and_then(|s| s.get(page_round_down(vaddr)))
            .map(|p| p.state)
    }

    /// Allocates the next stack page below the current stack bottom,
    /// zero-filled and mapped writable. Returns its address.
    pub fn alloc_stack_page(&self, pid: Pid) -> Result<usize> {
        let mut spaces = self.spaces.lock();
        self.push_stack_page(&mut spaces, pid)
    }

    /// Removes the page containing `vaddr`, releasing whichever resource
    /// backs it. Returns false if no entry covers the address, so a
    /// second free of the same page is a no-op rather than a double
    /// release.
    pub fn free_page(&self, pid: Pid, vaddr: usize) -> Result<bool> {
        let upage = page_round_down(vaddr);
        let mut spaces = self.spaces.lock();
        let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        self.release_entry(space, upage)
    }

    /// Resolves a page fault at `fault_addr`.
    ///
    /// `write` is the access type; `esp` is the faulting thread's stack
    /// pointer, consulted only when no entry covers the address and the
    /// fault might be stack growth. Always reaches one of the two
    /// terminal outcomes; internal failures turn into [`KillReason`]s,
    /// never panics.
    pub fn resolve_fault(
        &self,
        pid: Pid,
        fault_addr: usize,
        write: bool,
        esp: usize,
    ) -> FaultOutcome {
        if !is_user_vaddr(fault_addr) {
            return kill(pid, fault_addr, KillReason::KernelAddress);
        }
        let mut spaces = self.spaces.lock();
        match self.ensure_resident(&mut spaces, pid, fault_addr, write, esp) {
            // Present pages do not fault; the access violated the page's
            // protections.
            Ok(true) => kill(pid, fault_addr, KillReason::AccessViolation),
            Ok(false) => FaultOutcome::Loaded,
            Err(reason) => kill(pid, fault_addr, reason),
        }
    }

    /// Prepares `len` bytes at `addr` for a kernel access on behalf of
    /// `pid`, as the syscall layer does before dereferencing a user
    /// pointer. Every page in the span is made resident under the same
    /// rules as a hardware fault, including stack growth against `esp`;
    /// `write` additionally requires the whole span to be writable. The
    /// first page that cannot be resolved produces the kill verdict the
    /// faulting access would have.
    pub fn validate_user_buffer(
        &self,
        pid: Pid,
        addr: usize,
        len: usize,
        write: bool,
        esp: usize,
    ) -> FaultOutcome {
        if len == 0 {
            return if is_user_vaddr(addr) {
                FaultOutcome::Loaded
            } else {
                kill(pid, addr, KillReason::KernelAddress)
            };
        }
        let Some(last) = addr.checked_add(len - 1) else {
            return kill(pid, addr, KillReason::KernelAddress);
        };
        if !is_user_vaddr(addr) || !is_user_vaddr(last) {
            return kill(pid, addr, KillReason::KernelAddress);
        }
        let mut spaces = self.spaces.lock();
        let mut upage = page_round_down(addr);
        while upage <= page_round_down(last) {
            // Probe the first byte the access touches in this page, as a
            // copy walking the buffer would.
            let probe = upage.max(addr);
            if let Err(reason) = self.ensure_resident(&mut spaces, pid, probe, write, esp) {
                return kill(pid, probe, reason);
            }
            upage += PAGE_FRAME_SIZE;
        }
        FaultOutcome::Loaded
    }

    /// Advances the eviction clock one tick and ages every held frame:
    /// frames whose owning page was accessed since the last tick are
    /// refreshed and their accessed bit cleared; untouched frames keep
    /// their stale tick and become eviction candidates.
    pub fn timer_tick(&self) {
        let mut spaces = self.spaces.lock();
        let mut frames = self.frames.lock();
        frames.advance_tick();
        for (frame, pid, upage) in frames.held_frames() {
            let space = spaces
                .get_mut(&pid)
                .expect("held frame belongs to an unknown process");
            if space.page_dir.is_accessed(upage) {
                space.page_dir.clear_accessed(upage);
                frames.record_access(frame);
            }
        }
    }

    /// Runs `f` on `pid`'s page directory. This is how the trap glue and
    /// tests reach the concrete page table behind the [`PageDir`] seam.
    pub fn with_page_dir<R>(&self, pid: Pid, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        self.spaces.lock().get_mut(&pid).map(|s| f(&mut s.page_dir))
    }

    /// Runs `f` on the filesystem.
    pub fn with_fs<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.fs.lock())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().frame_count()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.lock().slots_in_use()
    }

    /// Reopens `file` and inserts a lazily loaded page for it. The caller
    /// has already verified the slot is vacant.
    #[allow(clippy::too_many_arguments)]
    fn insert_lazy_page(
        space: &mut AddressSpace<P>,
        fs: &mut F,
        upage: usize,
        file: FileHandle,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let private = fs.reopen(file)?;
        let inserted = space.insert(Page::lazy_file(
            upage,
            writable,
            FileOrigin {
                handle: private,
                offset,
                read_bytes,
                zero_bytes,
            },
        ));
        debug_assert!(inserted);
        Ok(())
    }

    /// Removes `upage`'s entry and releases its backing resource. The
    /// caller holds the address-space lock.
    fn release_entry(&self, space: &mut AddressSpace<P>, upage: usize) -> Result<bool> {
        let Some(page) = space.remove(upage) else {
            return Ok(false);
        };
        let released = match page.state {
            PageState::InMemory { frame } => {
                space.page_dir.clear(upage);
                self.frames.lock().free(frame);
                Ok(())
            }
            PageState::InSwap { slot } => self.swap.lock().free_slot(slot).map_err(VmError::from),
            PageState::InFilesystem => Ok(()),
        };
        if let Some(origin) = page.origin {
            self.fs.lock().close(origin.handle);
        }
        released.map(|_| true)
    }

    /// Makes the page containing `addr` resident, loading it from its
    /// file, bringing it back from swap, or growing the stack toward it
    /// if `addr` looks like a stack access against `esp`. Returns whether
    /// the page was already resident, or the reason the access is fatal.
    fn ensure_resident(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        addr: usize,
        write: bool,
        esp: usize,
    ) -> core::result::Result<bool, KillReason> {
        let upage = page_round_down(addr);
        let Some(space) = spaces.get(&pid) else {
            return Err(KillReason::NoMapping);
        };

        let Some((state, writable, origin)) =
            space.get(upage).map(|p| (p.state, p.writable, p.origin))
        else {
            if !is_stack_access(addr, esp) {
                return Err(KillReason::NoMapping);
            }
            return self
                .grow_stack_to(spaces, pid, upage)
                .map(|()| false)
                .map_err(|e| kill_reason_for(&e));
        };

        if write && !writable {
            return Err(KillReason::AccessViolation);
        }
        match state {
            PageState::InMemory { .. } => Ok(true),
            PageState::InFilesystem => {
                let origin = origin.expect("file-backed page without an origin");
                self.fault_in_file(spaces, pid, upage, origin, writable)
                    .map(|()| false)
                    .map_err(|e| kill_reason_for(&e))
            }
            PageState::InSwap { slot } => self
                .fault_in_swap(spaces, pid, upage, slot, writable)
                .map(|()| false)
                .map_err(|e| kill_reason_for(&e)),
        }
    }

    /// Obtains a frame for `(pid, upage)`, evicting the least recently
    /// used frame if the pool is full.
    ///
    /// The frame lock is held across victim selection and the victim's
    /// swap write, so no other thread can touch the frame mid-eviction.
    /// On error the victim is left resident and untouched.
    fn obtain_frame(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        upage: usize,
    ) -> Result<FrameId> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.try_alloc(pid, upage) {
            return Ok(frame);
        }

        let victim = frames
            .choose_victim()
            .expect("frame pool exhausted with no held frames");
        let (vpid, vupage) = frames.holder(victim).expect("eviction victim has no holder");
        let vspace = spaces
            .get_mut(&vpid)
            .expect("eviction victim held by an unknown process");
        let accessed = vspace.page_dir.is_accessed(vupage);
        let dirty = vspace.page_dir.is_dirty(vupage);
        let vpage = vspace
            .get_mut(vupage)
            .expect("eviction victim missing from its page table");
        debug_assert_eq!(vpage.state, PageState::InMemory { frame: victim });

        if !accessed && !dirty && vpage.origin.is_some() {
            // Untouched copy of file contents: drop it and re-read the
            // file on the next fault. No swap slot needed.
            vpage.state = PageState::InFilesystem;
        } else {
            let mut swap = self.swap.lock();
            let slot = swap.allocate_slot()?;
            if let Err(e) = swap.write_slot(slot, frames.frame_bytes(victim)) {
                let _ = swap.free_slot(slot);
                return Err(e.into());
            }
            vpage.state = PageState::InSwap { slot };
        }
        vspace.page_dir.clear(vupage);
        frames.reassign(victim, pid, upage);
        Ok(victim)
    }

    /// Loads `upage` from its file origin into a fresh frame.
    fn fault_in_file(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        upage: usize,
        origin: FileOrigin,
        writable: bool,
    ) -> Result<()> {
        let frame = self.obtain_frame(spaces, pid, upage)?;
        let fill = {
            let mut frames = self.frames.lock();
            let bytes = frames.frame_bytes_mut(frame);
            let mut fs = self.fs.lock();
            match fs.read(origin.handle, origin.offset, &mut bytes[..origin.read_bytes]) {
                Ok(n) if n == origin.read_bytes => {
                    bytes[origin.read_bytes..].fill(0);
                    Ok(())
                }
                Ok(_) => Err(VmError::Fs(fs::Error::Io)),
                Err(e) => Err(VmError::Fs(e)),
            }
        };
        if let Err(e) = fill {
            self.frames.lock().free(frame);
            return Err(e);
        }
        self.finish_load(spaces, pid, upage, frame, writable)
    }

    /// Loads `upage` back from swap into a fresh frame and releases its
    /// slot.
    fn fault_in_swap(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        upage: usize,
        slot: usize,
        writable: bool,
    ) -> Result<()> {
        let frame = self.obtain_frame(spaces, pid, upage)?;
        let fill = {
            let mut frames = self.frames.lock();
            let bytes = frames.frame_bytes_mut(frame);
            let mut swap = self.swap.lock();
            match swap.read_slot(slot, bytes) {
                // Contents are back in memory; the slot's job is done.
                Ok(()) => swap.free_slot(slot).map_err(VmError::from),
                Err(e) => Err(VmError::Swap(e)),
            }
        };
        if let Err(e) = fill {
            self.frames.lock().free(frame);
            return Err(e);
        }
        self.finish_load(spaces, pid, upage, frame, writable)
    }

    /// Installs the translation for a freshly filled frame and flips the
    /// page to resident.
    fn finish_load(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        upage: usize,
        frame: FrameId,
        writable: bool,
    ) -> Result<()> {
        let addr = self.frames.lock().frame_addr(frame);
        let space = spaces
            .get_mut(&pid)
            .expect("faulting process disappeared mid-resolution");
        if !space.page_dir.install(upage, addr, writable) {
            panic!("translation already present for a page being loaded");
        }
        let page = space
            .get_mut(upage)
            .expect("page entry disappeared mid-resolution");
        page.state = PageState::InMemory { frame };
        Ok(())
    }

    /// Grows the stack downward until `target` is covered and resident.
    fn grow_stack_to(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        target: usize,
    ) -> Result<()> {
        debug_assert!(is_page_aligned(target));
        loop {
            let space = spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
            if space.stack_bottom <= target {
                if space.contains(target) {
                    return Ok(());
                }
                // A hole left by free_page inside the grown region; give
                // the address a fresh zero page.
                return self.materialize_zero_page(spaces, pid, target);
            }
            self.push_stack_page(spaces, pid)?;
        }
    }

    /// Allocates, zeroes, and maps the next stack page below the current
    /// stack bottom.
    fn push_stack_page(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
    ) -> Result<usize> {
        let upage = {
            let space = spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
            if space.stack_pages() >= fault::MAX_STACK_PAGES {
                return Err(VmError::StackLimit);
            }
            let upage = space.stack_bottom - PAGE_FRAME_SIZE;
            if space.contains(upage) {
                return Err(VmError::PageExists);
            }
            upage
        };
        self.materialize_zero_page(spaces, pid, upage)?;
        spaces
            .get_mut(&pid)
            .expect("process disappeared during stack growth")
            .stack_bottom = upage;
        Ok(upage)
    }

    /// Allocates a zero-filled frame for `upage`, maps it writable, and
    /// records it resident.
    fn materialize_zero_page(
        &self,
        spaces: &mut BTreeMap<Pid, AddressSpace<P>>,
        pid: Pid,
        upage: usize,
    ) -> Result<()> {
        let frame = self.obtain_frame(spaces, pid, upage)?;
        let addr = {
            let mut frames = self.frames.lock();
            frames.frame_bytes_mut(frame).fill(0);
            frames.frame_addr(frame)
        };
        let space = spaces
            .get_mut(&pid)
            .expect("process disappeared during stack growth");
        if !space.page_dir.install(upage, addr, true) {
            panic!("translation already present for a new stack page");
        }
        let inserted = space.insert(Page::resident(upage, true, frame));
        debug_assert!(inserted);
        Ok(())
    }
}
