use crate::block::block_error::{BlockError, Result};
use crate::block::partitions::PartitionDevice;
use crate::block::ramdisk::RamDisk;
use alloc::{string::String, vec::Vec};
use core::fmt;
use marrowos_shared::println;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Role a block device plays in the system.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS kernel image
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap area
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by a foreign operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// # Safety
///
/// Callers must pass buffers of exactly `BLOCK_SECTOR_SIZE` bytes and
/// sectors within the device; drivers are allowed to assume both.
pub trait BlockOp {
    /// Read a block sector
    unsafe fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<()>;
    /// Write a block sector
    unsafe fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<()>;
}

/// Supported block drivers
#[derive(Clone)]
pub enum BlockDriver {
    Ram(RamDisk),
    Partition(PartitionDevice),
}

impl BlockDriver {
    fn as_op(&self) -> &dyn BlockOp {
        match self {
            BlockDriver::Ram(driver) => driver,
            BlockDriver::Partition(driver) => driver,
        }
    }

    pub(crate) fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<()> {
        // SAFETY: `Block` validates the sector and buffer before we get here.
        unsafe { self.as_op().read(sector, buf) }
    }

    pub(crate) fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<()> {
        // SAFETY: `Block` validates the sector and buffer before we get here.
        unsafe { self.as_op().write(sector, buf) }
    }
}

/// A block device
///
/// **Note:** Once blocks are made they are immutable
#[derive(Clone)]
pub struct Block {
    /// Unique and immutable index of the block
    index: usize,
    /// The name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: BlockDriver,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    fn verify_buffer(buf: &[u8]) -> Result<()> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    fn check_sector(&self, sector: BlockSector) -> Result<()> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must
    /// have room for `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<()> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain
    /// `BLOCK_SECTOR_SIZE` bytes. Returns after the block device has
    /// acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<()> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::ForeignWrite);
        }

        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub(crate) fn driver(&self) -> &BlockDriver {
        &self.driver
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "    {:04} | \"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.index,
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count,
            self.write_count
        )
    }
}

/// Maintain a list of blocks
pub struct BlockManager {
    /// All the block devices
    all_blocks: Vec<Block>,
    /// The next index to hand out
    next_index: usize,
}

impl Default for BlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockManager {
    pub fn new() -> Self {
        BlockManager {
            all_blocks: Vec::new(),
            next_index: 0,
        }
    }

    /// Register a block device with the given `name`. The block device's
    /// `block_size` in sectors and its `block_type` must be provided, as
    /// well as the `driver` to access the block.
    ///
    /// Returns the index of the block device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: BlockDriver,
    ) -> usize {
        let index = self.next_index;
        self.next_index += 1;

        self.all_blocks.push(Block {
            index,
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        });

        println!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        index
    }

    /// Get the block device with the given `index`.
    pub fn by_id(&mut self, idx: usize) -> Option<&mut Block> {
        self.all_blocks.iter_mut().find(|b| b.index == idx)
    }

    /// Remove and return the first block device with the given role.
    ///
    /// This is how subsystems take ownership of the device they sit on,
    /// e.g. the swap manager claiming the swap partition.
    pub fn take_by_type(&mut self, block_type: BlockType) -> Option<Block> {
        let pos = self
            .all_blocks
            .iter()
            .position(|b| b.block_type == block_type)?;
        Some(self.all_blocks.remove(pos))
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in self.all_blocks.iter() {
            writeln!(f, "{}", block)?;
        }
        Ok(())
    }
}
