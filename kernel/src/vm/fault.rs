//! Page-fault policy: outcomes, kill reasons, and the stack heuristic.
//!
//! The resolution algorithm itself lives on [`Vm`](super::Vm); this module
//! holds the pieces that are pure policy. Every fault ends in one of two
//! states: the page is resident and the faulting instruction can retry, or
//! the process is killed for a reason recorded here. Nothing in between
//! escapes to the caller.

use marrowos_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

use super::swap::SwapError;
use super::VmError;
use core::fmt;

/// First address above the user stack. The stack's highest page ends here
/// and growth proceeds downward.
pub const STACK_TOP: usize = OFFSET;

/// Hard cap on stack pages per process, bounding runaway growth.
pub const MAX_STACK_PAGES: usize = 2000;

/// How far below the stack pointer a fault may land and still count as a
/// stack access. PUSHA on x86 writes 32 bytes below %esp before any of
/// them are checked.
pub const PUSHA_BYTES: usize = 32;

/// Lowest address the stack may ever grow to.
pub const fn lowest_stack_address() -> usize {
    STACK_TOP - MAX_STACK_PAGES * PAGE_FRAME_SIZE
}

/// Terminal state of one fault resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident and mapped; retry the faulting instruction.
    Loaded,
    /// The fault could not be satisfied; the process must be terminated.
    Killed(KillReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The faulting address is not a user address.
    KernelAddress,
    /// No entry covers the address and it is not a stack access.
    NoMapping,
    /// Write to a read-only page, or a fault on a page that is already
    /// present and mapped.
    AccessViolation,
    /// Stack growth past [`MAX_STACK_PAGES`].
    StackOverflow,
    /// No swap slot was available to evict into.
    OutOfMemory,
    /// The backing file or swap device failed.
    IoError,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelAddress => write!(f, "page fault above the user address range"),
            Self::NoMapping => write!(f, "page fault on an unmapped address"),
            Self::AccessViolation => write!(f, "memory access violates page permissions"),
            Self::StackOverflow => write!(f, "stack growth past the configured limit"),
            Self::OutOfMemory => write!(f, "out of swap space"),
            Self::IoError => write!(f, "backing store I/O failed"),
        }
    }
}

/// Whether a fault at `fault_addr` with stack pointer `esp` looks like a
/// legitimate stack access: inside the stack region, and no further below
/// the stack pointer than a PUSHA would reach.
pub(crate) fn is_stack_access(fault_addr: usize, esp: usize) -> bool {
    fault_addr >= lowest_stack_address()
        && fault_addr < STACK_TOP
        && fault_addr >= esp.saturating_sub(PUSHA_BYTES)
}

/// Why a process dies when an internal operation fails mid-resolution.
pub(crate) fn kill_reason_for(error: &VmError) -> KillReason {
    match error {
        VmError::StackLimit => KillReason::StackOverflow,
        VmError::Swap(SwapError::Exhausted) => KillReason::OutOfMemory,
        VmError::Swap(_) | VmError::Fs(_) => KillReason::IoError,
        _ => KillReason::NoMapping,
    }
}
