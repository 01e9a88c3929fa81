//! MBR partition scanning.
//!
//! The disk image carries its kernel, filesystem, scratch and swap areas
//! as primary partitions identified by type byte; scanning registers each
//! one as its own block device so subsystems can claim them by role.
//!
//! Table layout reference: https://wiki.osdev.org/MBR_(x86)#MBR_format

use crate::block::block_core::{
    Block, BlockDriver, BlockManager, BlockOp, BlockSector, BlockType, BLOCK_SECTOR_SIZE,
};
use crate::block::block_error::Result;
use alloc::boxed::Box;
use alloc::format;
use marrowos_shared::{eprintln, println};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeroes, Unaligned};

/// A partition table entry in the MBR.
#[derive(FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
struct PartitionTableEntry {
    /// Drive attributes (bit 7 set = active or bootable)
    _bootable: u8,
    /// CHS address of partition start (the LBA below is authoritative)
    _start_chs: [u8; 3],
    /// Partition type
    partition_type: u8,
    /// CHS address of last partition sector
    _end_chs: [u8; 3],
    /// LBA of partition start
    offset: U32,
    /// Number of sectors in partition
    size: U32,
}

/// An MBR partition table, exactly one sector long.
#[derive(FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
struct PartitionTable {
    /// MBR bootstrap code (flat binary executable)
    _bootstrap: [u8; 440],
    /// Optional "unique disk ID"
    _disk_id: U32,
    /// Optional, reserved 0x0000
    _reserved: U16,
    /// The four primary partition table entries
    entries: [PartitionTableEntry; 4],
    /// (0x55, 0xAA) "valid bootsector" signature
    signature: U16,
}

const MBR_SIGNATURE: u16 = 0xAA55;

/// Block driver for one partition: defers to the parent disk's driver
/// with all sectors shifted by the partition's start.
#[derive(Clone)]
pub struct PartitionDevice {
    parent: Box<BlockDriver>,
    start: BlockSector,
}

impl BlockOp for PartitionDevice {
    unsafe fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<()> {
        self.parent.read(self.start + sector, buf)
    }

    unsafe fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<()> {
        self.parent.write(self.start + sector, buf)
    }
}

/// Scans `block` for MBR partitions, registering each one found with
/// `manager`.
pub fn partition_scan(manager: &mut BlockManager, block: &mut Block) {
    let mut part_nr = 0;
    read_partition_table(manager, block, 0, 0, &mut part_nr);
    if part_nr == 0 {
        eprintln!("{}: Device contains no partitions", block.get_name());
    }
}

fn read_partition_table(
    manager: &mut BlockManager,
    block: &mut Block,
    sector: BlockSector,
    primary_extended_sector: BlockSector,
    part_nr: &mut i32,
) {
    if sector >= block.get_size() {
        eprintln!(
            "{}: Partition table at sector {} past end of device ({} sectors)",
            block.get_name(),
            sector,
            block.get_size()
        );
        return;
    }

    let mut buf = [0u8; BLOCK_SECTOR_SIZE];
    if block.read(sector, &mut buf).is_err() {
        eprintln!("{}: Error reading partition table", block.get_name());
        return;
    }

    let Some(pt) = PartitionTable::read_from(&buf[..]) else {
        return;
    };

    if pt.signature.get() != MBR_SIGNATURE {
        if primary_extended_sector == 0 {
            eprintln!("{}: Invalid partition table signature", block.get_name());
        } else {
            eprintln!(
                "{}: Invalid extended partition table in sector {}",
                block.get_name(),
                sector
            );
        }
        return;
    }

    for entry in pt.entries.iter() {
        let (offset, size) = (entry.offset.get(), entry.size.get());
        if size == 0 || entry.partition_type == 0 {
            continue;
        } else if is_extended(entry.partition_type) {
            if sector == 0 {
                read_partition_table(manager, block, offset, offset, part_nr);
            } else {
                read_partition_table(
                    manager,
                    block,
                    offset + primary_extended_sector,
                    primary_extended_sector,
                    part_nr,
                );
            }
        } else {
            *part_nr += 1;
            found_partition(
                manager,
                block,
                entry.partition_type,
                offset + sector,
                size,
                *part_nr,
            );
        }
    }
}

fn is_extended(partition_type: u8) -> bool {
    matches!(partition_type, 0x05 | 0x0F | 0x85 | 0xC5)
}

fn found_partition(
    manager: &mut BlockManager,
    block: &mut Block,
    partition_type: u8,
    start: BlockSector,
    size: u32,
    part_nr: i32,
) {
    if start >= block.get_size() {
        eprintln!(
            "{}: Partition {} starts at sector {} past end of device ({} sectors)",
            block.get_name(),
            part_nr,
            start,
            block.get_size()
        );
    } else if start.overflowing_add(size).1 || start + size > block.get_size() {
        eprintln!(
            "{}: Partition {} ends at sector {} past end of device ({} sectors)",
            block.get_name(),
            part_nr,
            start + size,
            block.get_size()
        );
    } else {
        let b_type = match partition_type {
            0x20 => BlockType::Kernel,
            0x21 => BlockType::FileSystem,
            0x22 => BlockType::Scratch,
            0x23 => BlockType::Swap,
            _ => BlockType::Foreign,
        };

        println!(
            "{}: Found partition {} ({}), sectors {} to {}, {} sectors",
            block.get_name(),
            part_nr,
            partition_type_name(partition_type),
            start,
            start + size,
            size
        );

        let device = PartitionDevice {
            parent: Box::new(block.driver().clone()),
            start,
        };
        let name = format!("{}-{}", block.get_name(), part_nr);
        manager.register_block(b_type, &name, size, BlockDriver::Partition(device));
    }
}

fn partition_type_name(ty: u8) -> &'static str {
    match ty {
        0x01 => "FAT12",
        0x04 | 0x06 => "FAT16",
        0x05 | 0x0F | 0x85 | 0xC5 => "Extended",
        0x07 => "NTFS/exFAT",
        0x0B | 0x0C => "FAT32",
        0x20 => "Pintos OS kernel",
        0x21 => "Pintos file system",
        0x22 => "Pintos scratch",
        0x23 => "Pintos swap",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0xA5 => "FreeBSD",
        0xEE => "EFI GPT",
        0xEF => "EFI (FAT-12/16/32)",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::ramdisk::RamDisk;

    fn entry(partition_type: u8, offset: u32, size: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[4] = partition_type;
        e[8..12].copy_from_slice(&offset.to_le_bytes());
        e[12..16].copy_from_slice(&size.to_le_bytes());
        e
    }

    fn mbr(entries: &[[u8; 16]]) -> [u8; BLOCK_SECTOR_SIZE] {
        let mut sector = [0u8; BLOCK_SECTOR_SIZE];
        for (i, e) in entries.iter().enumerate() {
            sector[446 + i * 16..446 + (i + 1) * 16].copy_from_slice(e);
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn disk_with_mbr(sectors: BlockSector, mbr_sector: &[u8]) -> (BlockManager, Block) {
        let disk = RamDisk::new(sectors);
        unsafe { disk.write(0, mbr_sector).unwrap() };
        let mut manager = BlockManager::new();
        let idx = manager.register_block(BlockType::Raw, "rd", sectors, BlockDriver::Ram(disk));
        let block = manager.by_id(idx).cloned().unwrap();
        (manager, block)
    }

    #[test]
    fn finds_typed_partitions() {
        let table = mbr(&[entry(0x20, 1, 8), entry(0x23, 9, 16)]);
        let (mut manager, mut block) = disk_with_mbr(32, &table);

        partition_scan(&mut manager, &mut block);

        let kernel = manager.take_by_type(BlockType::Kernel).unwrap();
        assert_eq!(kernel.get_size(), 8);
        let swap = manager.take_by_type(BlockType::Swap).unwrap();
        assert_eq!(swap.get_size(), 16);
        assert_eq!(swap.get_name(), "rd-2");
    }

    #[test]
    fn partition_io_is_offset_by_start() {
        let table = mbr(&[entry(0x23, 4, 4)]);
        let (mut manager, mut block) = disk_with_mbr(8, &table);
        partition_scan(&mut manager, &mut block);

        let mut swap = manager.take_by_type(BlockType::Swap).unwrap();
        let payload = [0x5Au8; BLOCK_SECTOR_SIZE];
        swap.write(1, &payload).unwrap();

        // Sector 1 of the partition is sector 5 of the disk.
        let mut raw = [0u8; BLOCK_SECTOR_SIZE];
        block.read(5, &mut raw).unwrap();
        assert_eq!(raw, payload);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut table = mbr(&[entry(0x23, 1, 4)]);
        table[510] = 0;
        let (mut manager, mut block) = disk_with_mbr(8, &table);

        partition_scan(&mut manager, &mut block);
        assert!(manager.take_by_type(BlockType::Swap).is_none());
    }

    #[test]
    fn rejects_partition_past_device_end() {
        let table = mbr(&[entry(0x23, 4, 100)]);
        let (mut manager, mut block) = disk_with_mbr(8, &table);

        partition_scan(&mut manager, &mut block);
        assert!(manager.take_by_type(BlockType::Swap).is_none());
    }

    #[test]
    fn unknown_types_register_as_foreign() {
        let table = mbr(&[entry(0x83, 1, 4)]);
        let (mut manager, mut block) = disk_with_mbr(8, &table);

        partition_scan(&mut manager, &mut block);
        let mut foreign = manager.take_by_type(BlockType::Foreign).unwrap();
        assert!(foreign.write(0, &[0u8; BLOCK_SECTOR_SIZE]).is_err());
    }
}
