//! Memory-backed block device.
//!
//! Backs the hosted test suite and doubles as a scratch device on the
//! freestanding build. Clones share the underlying storage, so a disk
//! and the partitions carved out of it stay coherent.

use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::{BlockError, Result};
use crate::sync::Mutex;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone)]
pub struct RamDisk {
    data: Arc<Mutex<Vec<u8>>>,
}

impl RamDisk {
    /// Creates a zero-filled disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        RamDisk {
            data: Arc::new(Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE])),
        }
    }

    /// Creates a disk holding `bytes`, padded with zeros up to a whole
    /// number of sectors.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = Vec::from(bytes);
        let tail = data.len() % BLOCK_SECTOR_SIZE;
        if tail != 0 {
            data.resize(data.len() + BLOCK_SECTOR_SIZE - tail, 0);
        }
        RamDisk {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn sectors(&self) -> BlockSector {
        (self.data.lock().len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}

impl BlockOp for RamDisk {
    unsafe fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    unsafe fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}
