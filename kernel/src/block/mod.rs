pub mod block_core;
pub mod block_error;
pub mod partitions;
pub mod ramdisk;
