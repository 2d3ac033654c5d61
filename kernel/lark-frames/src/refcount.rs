use lark_addr::PhysAddr;
use lark_info::memory::{FRAME_CAPACITY, PAGE_SHIFT, RAM_BASE};

/// Dense per-frame reference counts for all of RAM.
///
/// Indexed by frame number relative to the base of physical memory; sized
/// once at compile time from the physical ceiling (the table never grows).
/// Lives behind a single [`SpinLock`](lark_sync::SpinLock) in the
/// allocator, distinct from the pool locks, and that lock is never held
/// across a pool operation.
pub(crate) struct RefCountTable {
    counts: [u16; FRAME_CAPACITY],
}

impl RefCountTable {
    pub(crate) const fn new() -> Self {
        Self {
            counts: [0; FRAME_CAPACITY],
        }
    }

    /// Table slot for a frame. `pa` must be aligned and inside RAM; the
    /// allocator validates both before calling.
    fn slot(pa: PhysAddr) -> usize {
        debug_assert!(pa.is_page_aligned());
        let idx = ((pa.as_u64() - RAM_BASE) >> PAGE_SHIFT) as usize;
        debug_assert!(idx < FRAME_CAPACITY);
        idx
    }

    pub(crate) fn get(&self, pa: PhysAddr) -> u16 {
        self.counts[Self::slot(pa)]
    }

    pub(crate) fn set(&mut self, pa: PhysAddr, count: u16) {
        self.counts[Self::slot(pa)] = count;
    }
}
