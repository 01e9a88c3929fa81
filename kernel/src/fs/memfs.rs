//! In-memory filesystem.
//!
//! Files are anonymous byte vectors with per-inode open counts; there is
//! no directory tree. Enough filesystem for exercising demand paging,
//! both in the hosted test suite and on a freestanding build without a
//! real disk.

use crate::fs::{Error, FileHandle, FileSystem, INodeNum, Result};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp::min;

struct MemFile {
    data: Vec<u8>,
    open_count: u32,
}

pub struct MemFs {
    inodes: BTreeMap<INodeNum, MemFile>,
    next_inode: INodeNum,
}

const NO_INODE: &str =
    "Couldn't find inode; either the kernel is using the filesystem incorrectly or a handle outlived its file.";

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> MemFs {
        MemFs {
            inodes: BTreeMap::new(),
            next_inode: 1,
        }
    }

    /// Creates a file holding `contents` and returns an open handle to it.
    pub fn create(&mut self, contents: &[u8]) -> FileHandle {
        let inode = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(
            inode,
            MemFile {
                data: Vec::from(contents),
                open_count: 1,
            },
        );
        FileHandle { inode }
    }

    /// Number of open handles to the file. Files themselves persist at
    /// zero so late write-backs still land somewhere observable.
    pub fn open_count(&self, file: FileHandle) -> u32 {
        self.get_file(file).open_count
    }

    /// Current contents of the file.
    pub fn contents(&self, file: FileHandle) -> &[u8] {
        &self.get_file(file).data
    }

    fn get_file(&self, file: FileHandle) -> &MemFile {
        self.inodes.get(&file.inode).expect(NO_INODE)
    }

    fn get_file_mut(&mut self, file: FileHandle) -> &mut MemFile {
        self.inodes.get_mut(&file.inode).expect(NO_INODE)
    }
}

impl FileSystem for MemFs {
    fn reopen(&mut self, file: FileHandle) -> Result<FileHandle> {
        let f = self.inodes.get_mut(&file.inode).ok_or(Error::NotFound)?;
        f.open_count += 1;
        Ok(FileHandle { inode: file.inode })
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let f = self.inodes.get(&file.inode).ok_or(Error::NotFound)?;
        if offset >= f.data.len() as u64 {
            // can't read any data
            return Ok(0);
        }
        let offset = offset as usize; // fits into usize by check above
        let read_len = min(buf.len(), f.data.len() - offset);
        buf[..read_len].copy_from_slice(&f.data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let f = self.inodes.get_mut(&file.inode).ok_or(Error::NotFound)?;
        if offset > (isize::MAX as u64).saturating_sub(buf.len() as u64) {
            return Err(Error::NoSpace);
        }
        let offset = offset as usize;
        let grow_amount = (offset + buf.len()).saturating_sub(f.data.len());
        f.data
            .try_reserve(grow_amount)
            .map_err(|_| Error::NoSpace)?;
        if grow_amount > 0 {
            f.data.resize(offset + buf.len(), 0);
        }
        f.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn length(&self, file: FileHandle) -> Result<u64> {
        let f = self.inodes.get(&file.inode).ok_or(Error::NotFound)?;
        Ok(f.data.len() as u64)
    }

    fn close(&mut self, file: FileHandle) {
        let f = self.get_file_mut(file);
        assert!(f.open_count > 0, "close without a matching open");
        f.open_count -= 1;
    }
}
