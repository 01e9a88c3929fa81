#![cfg_attr(target_os = "none", no_std)]

pub mod macros;
pub mod mem;
#[cfg(target_os = "none")]
pub mod serial;
pub mod sizes;
