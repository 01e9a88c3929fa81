//! The virtual-memory half of a small teaching kernel: per-process
//! supplemental page tables, a shared physical frame pool with aging
//! eviction, a slot allocator over a swap block device, and the
//! page-fault resolver that ties them together.
//!
//! Everything builds freestanding for the kernel target and hosted for
//! the test suite.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod user_program;
pub mod vm;

/// Process identifier. The process layer proper lives outside this
/// crate; the VM core only needs an owner key for address spaces.
pub type Pid = u16;
