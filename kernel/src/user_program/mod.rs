//! Loading user programs into an address space.

pub mod elf;
pub mod loader;

pub use loader::{load_executable, LoadError, LoadedProgram};
