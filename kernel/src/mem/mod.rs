//! Physical memory management for user frames.

pub mod bitmap;
pub mod user_pool;

pub use user_pool::{FrameId, UserPool};
