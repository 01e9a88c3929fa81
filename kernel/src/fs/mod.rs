//! The filesystem surface the VM core consumes.
//!
//! Demand paging only needs a byte-addressed read/write service keyed by
//! (handle, offset): lazily recorded pages each hold a privately reopened
//! handle, fault resolution reads through it, and unmapping writes dirty
//! mapped pages back through it. The on-disk filesystem proper lives
//! behind this trait.

pub mod memfs;

pub use memfs::MemFs;

pub type INodeNum = u64;

/// Handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// inode number of this file
    pub inode: INodeNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// no file for this handle
    NotFound,
    /// no space left on device
    NoSpace,
    /// device-level read or write failure
    Io,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Io => write!(f, "i/o error"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

pub trait FileSystem {
    /// Opens an independent handle to the same file, so the caller
    /// closing its own handle cannot invalidate this one.
    fn reopen(&mut self, file: FileHandle) -> Result<FileHandle>;

    /// Reads into `buf` at `offset`, returning how many bytes were read
    /// (zero or short at end-of-file).
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` at `offset`, growing the file if needed. Returns how
    /// many bytes were written.
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Length of the file in bytes.
    fn length(&self, file: FileHandle) -> Result<u64>;

    /// Closes the handle. Every `reopen` must be paired with exactly one
    /// `close`.
    fn close(&mut self, file: FileHandle);
}
