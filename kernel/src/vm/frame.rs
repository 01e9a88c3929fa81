//! Frame table: ownership and age tracking for user frames.
//!
//! Every frame handed out by the [`UserPool`] is tagged with its holder,
//! the (process, user page) pair whose contents occupy it, and the logical
//! tick at which it was last seen accessed. The timer advances the tick
//! and refreshes frames whose accessed bit is set; eviction picks the
//! frame with the stalest tick. Wiring the accessed bits to the holders'
//! page tables happens a layer up, where the page tables live.

use alloc::vec;
use alloc::vec::Vec;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

use crate::mem::{FrameId, UserPool};
use crate::Pid;

#[derive(Debug, Clone, Copy)]
struct FrameInfo {
    holder: Option<(Pid, usize)>,
    last_access: u64,
}

pub struct FrameTable {
    pool: UserPool,
    frames: Vec<FrameInfo>,
    tick: u64,
}

impl FrameTable {
    pub fn new(pool: UserPool) -> Self {
        let frames = vec![
            FrameInfo {
                holder: None,
                last_access: 0,
            };
            pool.frame_count()
        ];
        FrameTable {
            pool,
            frames,
            tick: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.pool.frame_count()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.holder.is_none()).count()
    }

    /// Claims a free frame for `(pid, upage)`, or `None` if every frame
    /// is held and the caller must evict first.
    pub fn try_alloc(&mut self, pid: Pid, upage: usize) -> Option<FrameId> {
        let frame = self.pool.alloc()?;
        self.frames[frame] = FrameInfo {
            holder: Some((pid, upage)),
            last_access: self.tick,
        };
        Some(frame)
    }

    /// Releases `frame` back to the pool.
    pub fn free(&mut self, frame: FrameId) {
        debug_assert!(self.frames[frame].holder.is_some());
        self.frames[frame].holder = None;
        self.pool.dealloc(frame);
    }

    pub fn holder(&self, frame: FrameId) -> Option<(Pid, usize)> {
        self.frames[frame].holder
    }

    /// Hands `frame` to a new holder without it passing through the free
    /// pool. This is the eviction path: the victim's contents have been
    /// saved and the same frame is immediately reused.
    pub fn reassign(&mut self, frame: FrameId, pid: Pid, upage: usize) {
        debug_assert!(self.frames[frame].holder.is_some());
        self.frames[frame] = FrameInfo {
            holder: Some((pid, upage)),
            last_access: self.tick,
        };
    }

    /// Marks `frame` as accessed at the current tick.
    pub fn record_access(&mut self, frame: FrameId) {
        debug_assert!(self.frames[frame].holder.is_some());
        self.frames[frame].last_access = self.tick;
    }

    pub fn advance_tick(&mut self) {
        self.tick += 1;
    }

    /// Held frames with their holders, for the timer's aging pass.
    pub fn held_frames(&self) -> Vec<(FrameId, Pid, usize)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.holder.map(|(pid, upage)| (i, pid, upage)))
            .collect()
    }

    /// Frame with the stalest access tick. Ties go to the lowest index,
    /// which keeps eviction order deterministic.
    pub fn choose_victim(&self) -> Option<FrameId> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.holder.is_some())
            .min_by_key(|(i, f)| (f.last_access, *i))
            .map(|(i, _)| i)
    }

    pub fn frame_addr(&self, frame: FrameId) -> usize {
        self.pool.frame_addr(frame)
    }

    /// The frame's bytes, for filling it or saving it out.
    pub fn frame_bytes_mut(&mut self, frame: FrameId) -> &mut [u8; PAGE_FRAME_SIZE] {
        assert!(self.pool.is_allocated(frame));
        // SAFETY: the pool exclusively owns the region and frames do not
        // overlap; &mut self keeps this the only live view.
        unsafe {
            &mut *self
                .pool
                .frame_ptr(frame)
                .as_ptr()
                .cast::<[u8; PAGE_FRAME_SIZE]>()
        }
    }

    pub fn frame_bytes(&self, frame: FrameId) -> &[u8; PAGE_FRAME_SIZE] {
        assert!(self.pool.is_allocated(frame));
        // SAFETY: as in frame_bytes_mut; &self views may alias freely.
        unsafe {
            &*self
                .pool
                .frame_ptr(frame)
                .as_ptr()
                .cast::<[u8; PAGE_FRAME_SIZE]>()
        }
    }
}
