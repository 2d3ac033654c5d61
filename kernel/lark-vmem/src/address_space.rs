use crate::page_table::{VpnIndex, table_mut};
use crate::pte::{Pte, PteFlags};
use lark_addr::{PhysAddr, PhysMapper, VirtAddr, align_down, align_up};
use lark_frames::{CpuFrames, FrameAllocError};
use lark_info::memory::{MAX_VA, PAGE_SIZE, PT_ENTRIES, PT_LEVELS};
use log::debug;

/// One process's page-table tree.
///
/// Holds the root table's frame and the mapper used to reach table frames;
/// the tree itself lives entirely in allocated frames. Table nodes are
/// created on demand by [`map`](Self::map) and given back by
/// [`free`](Self::free) / [`destroy`](Self::destroy).
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate an empty address space (a zeroed root table, no mappings).
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] when no frame is available for the
    /// root.
    pub fn create(frames: &CpuFrames<'_, 'm, M>) -> Result<Self, FrameAllocError> {
        let root = frames.alloc_zeroed()?;
        debug!("address space created, root {root}");
        Ok(Self {
            root,
            mapper: frames.mapper(),
        })
    }

    /// Frame of the root table; this is what goes into `satp` on a switch.
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Find the leaf entry for `va` without creating anything.
    ///
    /// `None` if an intermediate table on the path does not exist yet. The
    /// entry itself may still be invalid; callers check
    /// [`Pte::valid`].
    ///
    /// # Panics
    /// If `va` is at or beyond [`MAX_VA`]: addresses that high never come
    /// from a legal mapping, so a walk there means a kernel bug.
    #[must_use]
    pub fn walk(&self, va: VirtAddr) -> Option<&'m mut Pte> {
        assert!(va.as_u64() < MAX_VA, "walk: {va} out of range");
        // Safety: `root` and every branch target hold table nodes owned by
        // this tree.
        let mut table = unsafe { table_mut(self.mapper, self.root) };
        for level in (1..PT_LEVELS).rev() {
            let pte = table.entry(VpnIndex::of(va, level));
            if !pte.valid() {
                return None;
            }
            debug_assert!(!pte.is_leaf(), "walk: superpage leaf at level {level}");
            table = unsafe { table_mut(self.mapper, pte.phys_addr()) };
        }
        Some(table.entry_mut(VpnIndex::of(va, 0)))
    }

    /// Like [`walk`](Self::walk), but allocate missing intermediate tables
    /// (zeroed) on the way down.
    fn walk_create(
        &self,
        frames: &CpuFrames<'_, 'm, M>,
        va: VirtAddr,
    ) -> Result<&'m mut Pte, FrameAllocError> {
        assert!(va.as_u64() < MAX_VA, "walk: {va} out of range");
        let mut table = unsafe { table_mut(self.mapper, self.root) };
        for level in (1..PT_LEVELS).rev() {
            let pte = table.entry_mut(VpnIndex::of(va, level));
            let child = if pte.valid() {
                debug_assert!(!pte.is_leaf(), "walk: superpage leaf at level {level}");
                pte.phys_addr()
            } else {
                let child = frames.alloc_zeroed()?;
                *pte = Pte::branch(child);
                child
            };
            table = unsafe { table_mut(self.mapper, child) };
        }
        Ok(table.entry_mut(VpnIndex::of(va, 0)))
    }

    /// Map `size` bytes of virtual memory starting at `va` onto the
    /// physical range starting at `pa`, one 4 KiB leaf per page.
    ///
    /// `va` need not be aligned; the covered pages are those containing
    /// `[va, va + size)`. `pa` must be frame-aligned. Ownership of the
    /// frames stays with the caller's bookkeeping; mapping does not touch
    /// reference counts.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if an intermediate table cannot be
    /// allocated. Pages mapped before the failure stay mapped; the caller
    /// unwinds with [`unmap`](Self::unmap) or [`destroy`](Self::destroy).
    ///
    /// # Panics
    /// On a zero-length range, and on any page already mapped, since mapping
    /// over a live entry would silently leak its frame.
    pub fn map(
        &mut self,
        frames: &CpuFrames<'_, 'm, M>,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        flags: PteFlags,
    ) -> Result<(), FrameAllocError> {
        assert!(size > 0, "map: zero-length range");
        debug_assert!(pa.is_page_aligned());

        let last = VirtAddr::new(align_down(va.as_u64() + size - 1, PAGE_SIZE));
        let mut va = va.page_base();
        let mut pa = pa;
        loop {
            let pte = self.walk_create(frames, va)?;
            assert!(!pte.valid(), "map: {va} already mapped");
            *pte = Pte::leaf(pa, flags);
            if va == last {
                return Ok(());
            }
            va = va + PAGE_SIZE;
            pa = pa + PAGE_SIZE;
        }
    }

    /// Remove up to `npages` leaf mappings starting at `va`.
    ///
    /// Pages that were never materialized (missing table on the path, or an
    /// invalid entry) are skipped without complaint; lazily allocated
    /// ranges legitimately contain such holes. With `release`, each
    /// unmapped frame loses one reference.
    ///
    /// # Panics
    /// If `va` is not page-aligned, or a covered entry is a valid branch
    /// rather than a leaf.
    pub fn unmap(&mut self, frames: &CpuFrames<'_, 'm, M>, va: VirtAddr, npages: u64, release: bool) {
        assert!(va.is_page_aligned(), "unmap: {va} not page aligned");
        for n in 0..npages {
            let cur = va + n * PAGE_SIZE;
            let Some(pte) = self.walk(cur) else {
                continue;
            };
            if !pte.valid() {
                continue;
            }
            assert!(pte.is_leaf(), "unmap: {cur} maps a table, not a page");
            if release {
                frames.release(pte.phys_addr());
            }
            *pte = Pte::new();
        }
    }

    /// Physical address backing `va`, if `va` is mapped and user
    /// accessible.
    ///
    /// The software equivalent of the MMU's walk: `None` for anything the
    /// hardware would fault on from user mode: out-of-range, unmapped, or
    /// supervisor-only. Out-of-range is *not* a panic here, unlike
    /// [`walk`](Self::walk): untrusted addresses from user space flow
    /// through this path.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.as_u64() >= MAX_VA {
            return None;
        }
        let pte = self.walk(va)?;
        if !pte.valid() || !pte.user() || !pte.is_leaf() {
            return None;
        }
        Some(pte.phys_addr() + va.page_offset())
    }

    /// Clone the first `size` bytes of this space into `dest` for a fork,
    /// without copying page contents.
    ///
    /// Every mapped page is shared: its reference count goes up by one, and
    /// **both** sides end up with the same leaf (write permission dropped,
    /// [`PteFlags::COW`] set), so the first store from either side faults
    /// and gets a private copy. Holes (lazily allocated pages not yet
    /// materialized) are skipped and stay holes in the child.
    ///
    /// `dest` must not have mappings in the covered range.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if a table for `dest` cannot be
    /// allocated. Everything copied so far is unmapped from `dest` and the
    /// shares are returned; `dest` is left empty (its table nodes remain
    /// for [`destroy`](Self::destroy)). Pages of *this* space already
    /// switched to the shared encoding stay that way; they are still
    /// correct, just write-faulting once.
    pub fn copy_into(
        &mut self,
        frames: &CpuFrames<'_, 'm, M>,
        dest: &mut Self,
        size: u64,
    ) -> Result<(), FrameAllocError> {
        let npages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        for n in 0..npages {
            let va = VirtAddr::new(n * PAGE_SIZE);
            let Some(pte) = self.walk(va) else {
                continue;
            };
            if !pte.valid() {
                continue;
            }

            let pa = pte.phys_addr();
            let shared = pte.flags().difference(PteFlags::WRITE).union(PteFlags::COW);

            frames.share(pa);
            match dest.walk_create(frames, va) {
                Ok(dest_pte) => {
                    assert!(!dest_pte.valid(), "copy: {va} already mapped in destination");
                    *dest_pte = Pte::leaf(pa, shared);
                }
                Err(e) => {
                    frames.release(pa);
                    dest.unmap(frames, VirtAddr::new(0), n, true);
                    return Err(e);
                }
            }
            *pte = Pte::leaf(pa, shared);
        }
        Ok(())
    }

    /// Give back the table nodes of an address space with no remaining leaf
    /// mappings.
    ///
    /// # Panics
    /// If any leaf is still valid; unmap first, or use
    /// [`destroy`](Self::destroy).
    pub fn free(self, frames: &CpuFrames<'_, 'm, M>) {
        self.free_node(frames, self.root, PT_LEVELS - 1);
        debug!("address space freed, root was {}", self.root);
    }

    /// Tear the whole space down: unmap (and release) every page below
    /// `size`, then give back the table nodes.
    pub fn destroy(mut self, frames: &CpuFrames<'_, 'm, M>, size: u64) {
        let npages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        if npages > 0 {
            self.unmap(frames, VirtAddr::new(0), npages, true);
        }
        self.free(frames);
    }

    fn free_node(&self, frames: &CpuFrames<'_, 'm, M>, node: PhysAddr, level: usize) {
        let table = unsafe { table_mut(self.mapper, node) };
        for idx in 0..PT_ENTRIES {
            let pte = table.entry(VpnIndex::new(idx));
            if !pte.valid() {
                continue;
            }
            assert!(!pte.is_leaf(), "free: leaf still mapped");
            assert!(level > 0, "free: branch entry in a leaf table");
            self.free_node(frames, pte.phys_addr(), level - 1);
        }
        frames.release(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    use lark_addr::{Page, page_mut};
    use lark_frames::{FrameAllocator, FrameRegion};
    use lark_info::CpuId;
    use lark_info::memory::KERNEL_IMAGE_END;

    /// Simulated physical RAM, same shape as the allocator's test arena:
    /// 4 KiB frames addressed from just past the (pretend) kernel image.
    struct TestRam {
        base: u64,
        frames: Vec<core::cell::UnsafeCell<Page>>,
    }

    impl TestRam {
        fn new(frames: usize) -> Self {
            Self {
                base: KERNEL_IMAGE_END,
                frames: (0..frames)
                    .map(|_| core::cell::UnsafeCell::new(Page([0; PAGE_SIZE as usize])))
                    .collect(),
            }
        }

        fn region(&self) -> FrameRegion {
            FrameRegion::new(
                PhysAddr::new(self.base),
                PhysAddr::new(self.base + self.frames.len() as u64 * PAGE_SIZE),
            )
        }
    }

    impl PhysMapper for TestRam {
        unsafe fn phys_to_mut<'b, T>(&self, pa: PhysAddr) -> &'b mut T {
            let idx = ((pa.as_u64() - self.base) / PAGE_SIZE) as usize;
            let off = (pa.as_u64() % PAGE_SIZE) as usize;
            assert!(idx < self.frames.len(), "{pa} outside test RAM");
            let frame = self.frames[idx].get().cast::<u8>();
            unsafe { &mut *frame.add(off).cast::<T>() }
        }
    }

    const CPU0: CpuId = CpuId::new(0);
    const RW_USER: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::USER);

    #[test]
    fn map_then_translate_round_trips() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();

        let pa = frames.alloc().unwrap();
        let va = VirtAddr::new(0x4000);
        space.map(&frames, va, pa, PAGE_SIZE, RW_USER).unwrap();

        assert_eq!(space.translate(va), Some(pa));
        assert_eq!(space.translate(va + 5), Some(pa + 5));
        assert_eq!(space.translate(VirtAddr::new(0x5000)), None);
    }

    #[test]
    fn map_materializes_two_table_nodes_per_fresh_path() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);

        let mut space = AddressSpace::create(&frames).unwrap();
        let pa = frames.alloc().unwrap();
        let before = alloc.free_frames();

        // Fresh path: mid + leaf table get allocated.
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();
        assert_eq!(alloc.free_frames(), before - 2);

        // Neighbouring page reuses both.
        let pa2 = frames.alloc().unwrap();
        space
            .map(&frames, VirtAddr::new(PAGE_SIZE), pa2, PAGE_SIZE, RW_USER)
            .unwrap();
        assert_eq!(alloc.free_frames(), before - 3);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn remap_panics() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();

        let pa = frames.alloc().unwrap();
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "zero-length")]
    fn zero_length_map_panics() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();
        let pa = frames.alloc().unwrap();
        let _ = space.map(&frames, VirtAddr::new(0), pa, 0, RW_USER);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn walk_beyond_max_va_panics() {
        let ram = TestRam::new(8);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let space = AddressSpace::create(&frames).unwrap();
        let _ = space.walk(VirtAddr::new(MAX_VA));
    }

    #[test]
    fn translate_is_none_beyond_max_va_and_for_kernel_pages() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();

        assert_eq!(space.translate(VirtAddr::new(MAX_VA)), None);

        // Mapped, but not user accessible.
        let pa = frames.alloc().unwrap();
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, PteFlags::READ | PteFlags::WRITE)
            .unwrap();
        assert_eq!(space.translate(VirtAddr::new(0)), None);
    }

    #[test]
    fn unmap_releases_frames_and_skips_holes() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();

        let pa = frames.alloc().unwrap();
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();

        // Range covers one mapped page, one never-mapped page, and a page
        // whose table path does not even exist.
        space.unmap(&frames, VirtAddr::new(0), 3, true);

        assert_eq!(frames.refcount(pa), 0);
        assert_eq!(space.translate(VirtAddr::new(0)), None);
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn unaligned_unmap_panics() {
        let ram = TestRam::new(8);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();
        space.unmap(&frames, VirtAddr::new(0x10), 1, false);
    }

    #[test]
    fn copy_shares_frames_and_write_protects_both_sides() {
        let ram = TestRam::new(32);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);

        let mut parent = AddressSpace::create(&frames).unwrap();
        let pa0 = frames.alloc().unwrap();
        let pa1 = frames.alloc().unwrap();
        unsafe { page_mut(&ram, pa0) }.fill(0xaa);
        unsafe { page_mut(&ram, pa1) }.fill(0xbb);
        parent
            .map(&frames, VirtAddr::new(0), pa0, PAGE_SIZE, RW_USER)
            .unwrap();
        parent
            .map(&frames, VirtAddr::new(PAGE_SIZE), pa1, PAGE_SIZE, RW_USER)
            .unwrap();

        let mut child = AddressSpace::create(&frames).unwrap();
        parent
            .copy_into(&frames, &mut child, 2 * PAGE_SIZE)
            .unwrap();

        for va in [VirtAddr::new(0), VirtAddr::new(PAGE_SIZE)] {
            let pa = parent.translate(va).unwrap();
            assert_eq!(child.translate(va), Some(pa), "child maps a different frame");
            assert_eq!(frames.refcount(pa), 2);

            for pte in [parent.walk(va).unwrap(), child.walk(va).unwrap()] {
                assert!(pte.cow(), "shared page not tagged at {va}");
                assert!(!pte.writable(), "shared page still writable at {va}");
                assert!(pte.readable() && pte.user());
            }
        }

        // Contents were never touched.
        assert!(unsafe { page_mut(&ram, pa0) }.0.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn copy_skips_unmaterialized_pages() {
        let ram = TestRam::new(32);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);

        let mut parent = AddressSpace::create(&frames).unwrap();
        let pa = frames.alloc().unwrap();
        parent
            .map(&frames, VirtAddr::new(PAGE_SIZE), pa, PAGE_SIZE, RW_USER)
            .unwrap();

        // Three-page extent, only the middle page materialized.
        let mut child = AddressSpace::create(&frames).unwrap();
        parent
            .copy_into(&frames, &mut child, 3 * PAGE_SIZE)
            .unwrap();

        assert_eq!(child.translate(VirtAddr::new(0)), None);
        assert_eq!(child.translate(VirtAddr::new(PAGE_SIZE)), Some(pa));
        assert_eq!(child.translate(VirtAddr::new(2 * PAGE_SIZE)), None);
        assert_eq!(frames.refcount(pa), 2);
    }

    #[test]
    fn destroying_the_child_returns_the_shares() {
        let ram = TestRam::new(32);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);

        let mut parent = AddressSpace::create(&frames).unwrap();
        let pa = frames.alloc().unwrap();
        parent
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();

        let mut child = AddressSpace::create(&frames).unwrap();
        parent.copy_into(&frames, &mut child, PAGE_SIZE).unwrap();
        assert_eq!(frames.refcount(pa), 2);

        child.destroy(&frames, PAGE_SIZE);
        assert_eq!(frames.refcount(pa), 1);

        // The parent still maps the page, read-only until its next store.
        let pte = parent.walk(VirtAddr::new(0)).unwrap();
        assert!(pte.valid() && pte.cow() && !pte.writable());
    }

    #[test]
    fn destroy_returns_every_frame() {
        let ram = TestRam::new(32);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let before = alloc.free_frames();

        let mut space = AddressSpace::create(&frames).unwrap();
        // Pages in two different leaf tables (around the 2 MiB mark).
        for va in [0, PAGE_SIZE, 512 * PAGE_SIZE] {
            let pa = frames.alloc().unwrap();
            space
                .map(&frames, VirtAddr::new(va), pa, PAGE_SIZE, RW_USER)
                .unwrap();
        }

        space.destroy(&frames, 513 * PAGE_SIZE);
        assert_eq!(alloc.free_frames(), before);
    }

    #[test]
    #[should_panic(expected = "leaf still mapped")]
    fn free_with_live_mappings_panics() {
        let ram = TestRam::new(16);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);
        let mut space = AddressSpace::create(&frames).unwrap();
        let pa = frames.alloc().unwrap();
        space
            .map(&frames, VirtAddr::new(0), pa, PAGE_SIZE, RW_USER)
            .unwrap();
        space.free(&frames);
    }

    #[test]
    fn failed_copy_unwinds_the_destination() {
        // Parent: root + mid + two leaf tables + two data frames = 6.
        // Child copy needs root + mid + two leaf tables; sized so the
        // second leaf table cannot be allocated.
        let ram = TestRam::new(9);
        let alloc = FrameAllocator::new(&ram, ram.region());
        let frames = alloc.on_cpu(CPU0);

        let mut parent = AddressSpace::create(&frames).unwrap();
        let pa0 = frames.alloc().unwrap();
        let pa1 = frames.alloc().unwrap();
        parent
            .map(&frames, VirtAddr::new(0), pa0, PAGE_SIZE, RW_USER)
            .unwrap();
        parent
            .map(&frames, VirtAddr::new(512 * PAGE_SIZE), pa1, PAGE_SIZE, RW_USER)
            .unwrap();

        let mut child = AddressSpace::create(&frames).unwrap();
        let size = 513 * PAGE_SIZE;
        assert_eq!(
            parent.copy_into(&frames, &mut child, size),
            Err(FrameAllocError::Exhausted)
        );

        // All shares were returned; the child maps nothing.
        assert_eq!(frames.refcount(pa0), 1);
        assert_eq!(frames.refcount(pa1), 1);
        assert_eq!(child.translate(VirtAddr::new(0)), None);

        // The page that made it across before the failure keeps the shared
        // encoding in the parent; the one after the failure point does not.
        assert!(parent.walk(VirtAddr::new(0)).unwrap().cow());
        assert!(!parent.walk(VirtAddr::new(512 * PAGE_SIZE)).unwrap().cow());

        // Both spaces still tear down cleanly.
        let before = alloc.free_frames();
        child.destroy(&frames, size);
        parent.destroy(&frames, size);
        assert!(alloc.free_frames() > before);
    }
}
