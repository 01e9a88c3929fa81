/// Error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// sector index past the end of the device
    SectorOutOfBounds,
    /// buffer length is not exactly `BLOCK_SECTOR_SIZE`
    BufferInvalid,
    /// device failed to complete a read
    ReadError,
    /// device failed to complete a write
    WriteError,
    /// write attempted on a block owned by another operating system
    ForeignWrite,
}

impl core::fmt::Display for BlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SectorOutOfBounds => write!(f, "sector out of bounds"),
            Self::BufferInvalid => write!(f, "buffer is not one sector long"),
            Self::ReadError => write!(f, "error reading from the block device"),
            Self::WriteError => write!(f, "error writing to the block device"),
            Self::ForeignWrite => write!(f, "write to a foreign block device"),
        }
    }
}

impl core::error::Error for BlockError {}

pub type Result<T> = core::result::Result<T, BlockError>;
