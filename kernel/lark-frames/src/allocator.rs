use crate::free_pool::FreePool;
use crate::refcount::RefCountTable;
use lark_addr::{PhysAddr, PhysMapper, page_mut};
use lark_info::CpuId;
use lark_info::cpu::MAX_CPUS;
use lark_info::memory::{KERNEL_IMAGE_END, PAGE_SIZE, PHYS_CEILING, RAM_BASE};
use lark_sync::{IrqGuard, SpinLock};
use log::debug;

/// Byte written over a frame when it is handed out.
///
/// Freshly allocated memory is junk, not zero; a caller that reads it
/// before initializing sees a recognizable pattern instead of whatever the
/// previous owner left behind.
pub const ALLOC_FILL: u8 = 0x05;

/// Byte written over a frame when its last reference is dropped, so a
/// dangling reader sees junk rather than stale data.
pub const FREE_FILL: u8 = 0x01;

/// Allocation failure. Exhaustion is the only recoverable error the
/// allocator reports; every other misuse is a consistency violation and
/// panics.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical frames")]
    Exhausted,
}

/// The contiguous span of frames the allocator manages.
#[derive(Copy, Clone, Debug)]
pub struct FrameRegion {
    start: PhysAddr,
    end: PhysAddr,
}

impl FrameRegion {
    /// A span of frames in `[start, end)`.
    ///
    /// # Panics
    /// If the bounds are unaligned, empty, or fall outside physical RAM.
    #[must_use]
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        assert!(
            start.is_page_aligned() && end.is_page_aligned(),
            "frame region: unaligned bounds"
        );
        assert!(start < end, "frame region: empty");
        assert!(
            start.as_u64() >= RAM_BASE && end.as_u64() <= PHYS_CEILING,
            "frame region: outside physical RAM"
        );
        Self { start, end }
    }

    /// Everything between the kernel image and the physical ceiling.
    #[must_use]
    pub fn boot() -> Self {
        Self::new(PhysAddr::new(KERNEL_IMAGE_END), PhysAddr::new(PHYS_CEILING))
    }

    /// Number of frames in the region.
    #[must_use]
    pub const fn frames(&self) -> u64 {
        (self.end.as_u64() - self.start.as_u64()) / PAGE_SIZE
    }

    const fn contains(&self, pa: PhysAddr) -> bool {
        self.start.as_u64() <= pa.as_u64() && pa.as_u64() < self.end.as_u64()
    }
}

/// The physical frame allocator: per-CPU free pools plus the global
/// reference-count table.
///
/// Shared by reference from every core; all interior state is lock
/// protected. See the crate docs for the locking protocol.
pub struct FrameAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    region: FrameRegion,
    pools: [SpinLock<FreePool>; MAX_CPUS],
    refcounts: SpinLock<RefCountTable>,
}

impl<'m, M: PhysMapper> FrameAllocator<'m, M> {
    /// Take ownership of `region` and partition its frames evenly across
    /// the per-CPU pools (remainder to the last pool), scrubbing each.
    ///
    /// Called once at boot, before any other core allocates.
    pub fn new(mapper: &'m M, region: FrameRegion) -> Self {
        let allocator = Self {
            mapper,
            region,
            pools: core::array::from_fn(|_| SpinLock::new(FreePool::new())),
            refcounts: SpinLock::new(RefCountTable::new()),
        };

        let total = region.frames();
        let per_pool = total / MAX_CPUS as u64;
        let remainder = total % MAX_CPUS as u64;

        let mut pa = region.start;
        for (cpu, pool) in allocator.pools.iter().enumerate() {
            let mut quota = per_pool;
            if cpu == MAX_CPUS - 1 {
                quota += remainder;
            }
            let mut pool = pool.lock();
            for _ in 0..quota {
                // Safety: boot-time, single owner of the whole region.
                unsafe { page_mut(mapper, pa) }.fill(FREE_FILL);
                pool.push(mapper, pa);
                pa = pa + PAGE_SIZE;
            }
        }

        debug!(
            "frame allocator: {total} frames in [{}, {}), {per_pool}+{remainder} per pool",
            region.start, region.end
        );
        allocator
    }

    /// Hand out one frame with reference count 1 and junk contents.
    ///
    /// Pops from `cpu`'s own pool; if that is empty, probes every other
    /// pool in ascending index order, taking and releasing each lock
    /// exactly once, and hands the first frame found straight to the
    /// caller. If every pool is empty the allocator is exhausted: fatal
    /// for kernel-internal callers, a plain allocation failure to
    /// propagate for user-memory callers.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] when no pool holds a frame.
    pub fn alloc(&self, cpu: CpuId) -> Result<PhysAddr, FrameAllocError> {
        let _irq = IrqGuard::new();

        let pa = self
            .pop_any(cpu)
            .ok_or(FrameAllocError::Exhausted)?;

        // Safety: the frame just left a free list; nobody else holds it.
        unsafe { page_mut(self.mapper, pa) }.fill(ALLOC_FILL);

        let mut counts = self.refcounts.lock();
        assert!(
            counts.get(pa) == 0,
            "alloc: frame {pa} was on a free list with live references"
        );
        counts.set(pa, 1);
        Ok(pa)
    }

    /// Drop one reference to `pa`; recycle the frame if it was the last.
    ///
    /// A frame whose count stays positive (the other side of a COW pair
    /// still maps it) is left untouched. A frame whose count reaches 0 is
    /// scrubbed and pushed onto **this** CPU's pool, not necessarily the
    /// pool it was first carved into.
    ///
    /// # Panics
    /// On unaligned or out-of-range addresses, and on a count that is
    /// already 0 (double free, or release without a matching allocate);
    /// all of these mean a bug in the caller, and continuing would corrupt
    /// memory.
    pub fn release(&self, cpu: CpuId, pa: PhysAddr) {
        self.check_managed(pa, "release");
        let _irq = IrqGuard::new();

        {
            let mut counts = self.refcounts.lock();
            let count = counts.get(pa);
            assert!(count != 0, "release: frame {pa} has no live references");
            counts.set(pa, count - 1);
            if count > 1 {
                return;
            }
        }

        // Count reached 0; the refcount lock is dropped before the pool
        // lock is taken.
        unsafe { page_mut(self.mapper, pa) }.fill(FREE_FILL);
        self.pools[cpu.as_usize()].lock().push(self.mapper, pa);
    }

    /// Add one reference to an already-held frame (COW setup only).
    ///
    /// # Panics
    /// On out-of-range addresses, on a count of 0 (sharing a frame nobody
    /// holds means a corrupt page table), and on counter overflow.
    pub fn share(&self, pa: PhysAddr) {
        self.check_managed(pa, "share");
        let _irq = IrqGuard::new();
        let mut counts = self.refcounts.lock();
        let count = counts.get(pa);
        assert!(count != 0, "share: frame {pa} has no live references");
        counts.set(pa, count.checked_add(1).expect("share: refcount overflow"));
    }

    /// Current reference count of `pa`. Decision input for the COW
    /// resolver, diagnostic everywhere else.
    #[must_use]
    pub fn refcount(&self, pa: PhysAddr) -> u16 {
        self.check_managed(pa, "refcount");
        let _irq = IrqGuard::new();
        self.refcounts.lock().get(pa)
    }

    /// Total frames currently sitting on free lists, across all pools.
    ///
    /// Feeds the `sysinfo`-style free-memory report; the figure is a
    /// snapshot, exact only while nothing else allocates.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        let _irq = IrqGuard::new();
        self.pools.iter().map(|p| p.lock().len()).sum()
    }

    /// Bind this allocator to a core, yielding the handle the paging
    /// layers pass around.
    #[must_use]
    pub const fn on_cpu<'a>(&'a self, cpu: CpuId) -> CpuFrames<'a, 'm, M> {
        CpuFrames { alloc: self, cpu }
    }

    /// Pop from the local pool, else steal. The local lock is **not** held
    /// while the other pools are probed; interrupts are already off, so
    /// nothing on this core can race the window where the empty local pool
    /// is unlocked.
    fn pop_any(&self, cpu: CpuId) -> Option<PhysAddr> {
        if let Some(pa) = self.pools[cpu.as_usize()].lock().pop(self.mapper) {
            return Some(pa);
        }
        for (other, pool) in self.pools.iter().enumerate() {
            if other == cpu.as_usize() {
                continue;
            }
            if let Some(pa) = pool.lock().pop(self.mapper) {
                return Some(pa);
            }
        }
        None
    }

    fn check_managed(&self, pa: PhysAddr, op: &str) {
        assert!(pa.is_page_aligned(), "{op}: unaligned frame {pa}");
        assert!(
            self.region.contains(pa),
            "{op}: frame {pa} outside managed range"
        );
    }
}

/// A frame allocator bound to one core.
///
/// The page-table and fault layers take this instead of an allocator plus
/// a loose `CpuId`, so a frame released deep inside an unmap lands on the
/// right core's pool.
pub struct CpuFrames<'a, 'm, M: PhysMapper> {
    alloc: &'a FrameAllocator<'m, M>,
    cpu: CpuId,
}

impl<'a, 'm, M: PhysMapper> CpuFrames<'a, 'm, M> {
    /// See [`FrameAllocator::alloc`].
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] when no pool holds a frame.
    pub fn alloc(&self) -> Result<PhysAddr, FrameAllocError> {
        self.alloc.alloc(self.cpu)
    }

    /// Allocate and zero-fill: page-table nodes and lazily materialized
    /// pages must start all-zero, not junk.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] when no pool holds a frame.
    pub fn alloc_zeroed(&self) -> Result<PhysAddr, FrameAllocError> {
        let pa = self.alloc()?;
        // Safety: sole owner of a frame just handed out.
        unsafe { page_mut(self.mapper(), pa) }.fill(0);
        Ok(pa)
    }

    /// See [`FrameAllocator::release`].
    pub fn release(&self, pa: PhysAddr) {
        self.alloc.release(self.cpu, pa);
    }

    /// See [`FrameAllocator::share`].
    pub fn share(&self, pa: PhysAddr) {
        self.alloc.share(pa);
    }

    /// See [`FrameAllocator::refcount`].
    #[must_use]
    pub fn refcount(&self, pa: PhysAddr) -> u16 {
        self.alloc.refcount(pa)
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.alloc.mapper
    }

    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }
}
