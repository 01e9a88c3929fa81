//! Swap space carved into page-sized slots.
//!
//! The swap block device is divided into slots of [`SLOT_SECTORS`]
//! consecutive sectors, each large enough for one page frame. A bitmap
//! tracks which slots hold evicted page contents. Slot indices are handed
//! out by [`SwapSpace::allocate_slot`] and remain valid until freed, so a
//! page's supplemental entry can name its slot while the page is out of
//! memory.

use crate::block::block_core::{Block, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::mem::bitmap::Bitmap;
use core::fmt;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Index of a page-sized slot within the swap device.
pub type SwapSlot = usize;

/// Sectors per slot: one page frame's worth.
pub const SLOT_SECTORS: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// Every slot is in use. Recoverable: the faulting process is killed,
    /// the kernel carries on.
    Exhausted,
    /// The slot is not currently allocated. Freeing or reading such a
    /// slot means the caller's page bookkeeping has gone wrong.
    SlotNotAllocated,
    /// The slot index is past the end of the device.
    SlotOutOfRange,
    /// The underlying block device failed.
    Device(BlockError),
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "no free swap slots"),
            Self::SlotNotAllocated => write!(f, "swap slot is not allocated"),
            Self::SlotOutOfRange => write!(f, "swap slot index out of range"),
            Self::Device(e) => write!(f, "swap device error: {}", e),
        }
    }
}

impl core::error::Error for SwapError {}

impl From<BlockError> for SwapError {
    fn from(e: BlockError) -> Self {
        Self::Device(e)
    }
}

pub type Result<T> = core::result::Result<T, SwapError>;

pub struct SwapSpace {
    device: Block,
    map: Bitmap,
}

impl SwapSpace {
    /// Builds swap space over `device`, using as many whole slots as fit.
    pub fn new(device: Block) -> Self {
        let slots = device.get_size() as usize / SLOT_SECTORS;
        SwapSpace {
            device,
            map: Bitmap::new(slots),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.map.len()
    }

    /// Number of slots currently holding evicted pages.
    pub fn slots_in_use(&self) -> usize {
        self.map.count_allocated()
    }

    /// Claims the lowest free slot.
    pub fn allocate_slot(&mut self) -> Result<SwapSlot> {
        let slot = self.map.first_free().ok_or(SwapError::Exhausted)?;
        self.map.allocate(slot);
        Ok(slot)
    }

    /// Releases `slot` for reuse. The slot's contents are not erased;
    /// a later [`Self::allocate_slot`] may hand the slot out again.
    pub fn free_slot(&mut self, slot: SwapSlot) -> Result<()> {
        self.check_allocated(slot)?;
        self.map.deallocate(slot);
        Ok(())
    }

    /// Fills `buf` with the page stored in `slot`.
    pub fn read_slot(&mut self, slot: SwapSlot, buf: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        self.check_allocated(slot)?;
        let base = Self::first_sector(slot);
        for i in 0..SLOT_SECTORS {
            let chunk = &mut buf[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            self.device.read(base + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Writes one page of memory into `slot`.
    pub fn write_slot(&mut self, slot: SwapSlot, buf: &[u8; PAGE_FRAME_SIZE]) -> Result<()> {
        self.check_allocated(slot)?;
        let base = Self::first_sector(slot);
        for i in 0..SLOT_SECTORS {
            let chunk = &buf[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            self.device.write(base + i as u32, chunk)?;
        }
        Ok(())
    }

    fn first_sector(slot: SwapSlot) -> u32 {
        (slot * SLOT_SECTORS) as u32
    }

    fn check_allocated(&self, slot: SwapSlot) -> Result<()> {
        if slot >= self.map.len() {
            return Err(SwapError::SlotOutOfRange);
        }
        if !self.map.is_allocated(slot) {
            return Err(SwapError::SlotNotAllocated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::block_core::{BlockDriver, BlockManager, BlockType};
    use crate::block::ramdisk::RamDisk;

    fn swap_space(slots: usize) -> SwapSpace {
        let mut manager = BlockManager::new();
        let disk = RamDisk::new((slots * SLOT_SECTORS) as u32);
        manager.register_block(
            BlockType::Swap,
            "swap",
            disk.sectors(),
            BlockDriver::Ram(disk),
        );
        let device = manager
            .take_by_type(BlockType::Swap)
            .expect("swap device was just registered");
        SwapSpace::new(device)
    }

    fn page_of(byte: u8) -> [u8; PAGE_FRAME_SIZE] {
        [byte; PAGE_FRAME_SIZE]
    }

    #[test]
    fn round_trips_page_contents() {
        let mut swap = swap_space(4);
        let slot = swap.allocate_slot().unwrap();

        let mut page = page_of(0);
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        swap.write_slot(slot, &page).unwrap();

        let mut back = page_of(0);
        swap.read_slot(slot, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
    }

    #[test]
    fn slots_do_not_overlap() {
        let mut swap = swap_space(3);
        let a = swap.allocate_slot().unwrap();
        let b = swap.allocate_slot().unwrap();

        swap.write_slot(a, &page_of(0xAA)).unwrap();
        swap.write_slot(b, &page_of(0xBB)).unwrap();

        let mut buf = page_of(0);
        swap.read_slot(a, &mut buf).unwrap();
        assert_eq!(buf[..], page_of(0xAA)[..]);
        swap.read_slot(b, &mut buf).unwrap();
        assert_eq!(buf[..], page_of(0xBB)[..]);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let mut swap = swap_space(2);
        swap.allocate_slot().unwrap();
        swap.allocate_slot().unwrap();
        assert_eq!(swap.allocate_slot(), Err(SwapError::Exhausted));

        swap.free_slot(0).unwrap();
        assert_eq!(swap.allocate_slot(), Ok(0));
    }

    #[test]
    fn double_free_is_an_error() {
        let mut swap = swap_space(2);
        let slot = swap.allocate_slot().unwrap();
        swap.free_slot(slot).unwrap();
        assert_eq!(swap.free_slot(slot), Err(SwapError::SlotNotAllocated));
        assert_eq!(swap.free_slot(99), Err(SwapError::SlotOutOfRange));
    }

    #[test]
    fn freed_slots_cannot_be_read() {
        let mut swap = swap_space(2);
        let slot = swap.allocate_slot().unwrap();
        swap.write_slot(slot, &page_of(1)).unwrap();
        swap.free_slot(slot).unwrap();
        let mut buf = page_of(0);
        assert_eq!(
            swap.read_slot(slot, &mut buf),
            Err(SwapError::SlotNotAllocated)
        );
    }

    #[test]
    fn slot_count_uses_whole_slots_only() {
        let mut manager = BlockManager::new();
        // 1.5 slots' worth of sectors rounds down to one slot.
        let disk = RamDisk::new((SLOT_SECTORS + SLOT_SECTORS / 2) as u32);
        manager.register_block(
            BlockType::Swap,
            "swap",
            disk.sectors(),
            BlockDriver::Ram(disk),
        );
        let device = manager.take_by_type(BlockType::Swap).unwrap();
        let swap = SwapSpace::new(device);
        assert_eq!(swap.slot_count(), 1);
    }
}
