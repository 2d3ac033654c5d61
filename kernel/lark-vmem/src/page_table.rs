use crate::pte::Pte;
use lark_addr::{PhysAddr, PhysMapper, VirtAddr};
use lark_info::memory::{PAGE_SHIFT, PT_ENTRIES, PT_LEVELS};

/// One 4 KiB page-table node: 512 entries of 8 bytes, at frame alignment.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Pte; PT_ENTRIES],
}

impl PageTable {
    pub fn entry(&self, idx: VpnIndex) -> Pte {
        self.entries[idx.as_usize()]
    }

    pub fn entry_mut(&mut self, idx: VpnIndex) -> &mut Pte {
        &mut self.entries[idx.as_usize()]
    }
}

/// A bounds-checked index into one page-table node (9 bits of the VA).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VpnIndex(usize);

impl VpnIndex {
    /// The index a walk at `level` uses for `va`. Level 2 is the root,
    /// level 0 the leaf table.
    #[must_use]
    pub const fn of(va: VirtAddr, level: usize) -> Self {
        assert!(level < PT_LEVELS);
        Self(((va.as_u64() >> (PAGE_SHIFT + 9 * level as u64)) & 0x1ff) as usize)
    }

    /// Wrap a raw slot number.
    ///
    /// # Panics
    /// If `idx` does not fit a table.
    #[must_use]
    pub const fn new(idx: usize) -> Self {
        assert!(idx < PT_ENTRIES, "VpnIndex out of range");
        Self(idx)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// View the frame at `pa` as a page-table node.
///
/// # Safety
/// `pa` must be a frame holding a page-table node reachable through `m`,
/// with no other live reference to it.
#[inline]
pub(crate) unsafe fn table_mut<'t, M: PhysMapper>(m: &M, pa: PhysAddr) -> &'t mut PageTable {
    debug_assert!(pa.is_page_aligned());
    unsafe { m.phys_to_mut::<PageTable>(pa) }
}

const _: () = {
    assert!(core::mem::size_of::<PageTable>() == 4096);
    assert!(core::mem::align_of::<PageTable>() == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_indices_slice_the_va_top_down() {
        // va = index 1 at the root, 2 in the middle, 3 at the leaf.
        let va = VirtAddr::new((1 << 30) | (2 << 21) | (3 << 12));
        assert_eq!(VpnIndex::of(va, 2).as_usize(), 1);
        assert_eq!(VpnIndex::of(va, 1).as_usize(), 2);
        assert_eq!(VpnIndex::of(va, 0).as_usize(), 3);
    }
}
