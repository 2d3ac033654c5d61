use crate::access::AccessKind;
use lark_addr::{PhysAddr, PhysMapper, VirtAddr, align_up, page_mut};
use lark_frames::{CpuFrames, FrameAllocError};
use lark_info::memory::{MAX_VA, PAGE_SIZE};
use lark_vmem::{AddressSpace, Pte, PteFlags};
use log::warn;

/// What the trap path should do after a page fault was examined.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultResolution {
    /// The mapping was repaired; re-execute the faulting instruction.
    Resolved,
    /// The fault is the process's own doing (or memory ran out); kill it.
    Terminate,
}

/// Permissions given to a lazily materialized page.
const LAZY_FLAGS: PteFlags = PteFlags::READ
    .union(PteFlags::WRITE)
    .union(PteFlags::EXECUTE)
    .union(PteFlags::USER);

/// One process's view of memory: its address space plus the bounds the
/// fault resolvers judge against.
///
/// `size` is the byte extent of the process image; everything a fault
/// may legitimately touch lies below it. `lazy_floor` is the lowest
/// address at which a *missing* page may be materialized on demand;
/// faults below it hit the stack guard and terminate the process.
pub struct ProcessVm<'m, M: PhysMapper> {
    space: AddressSpace<'m, M>,
    size: u64,
    lazy_floor: u64,
}

impl<'m, M: PhysMapper> ProcessVm<'m, M> {
    #[must_use]
    pub const fn new(space: AddressSpace<'m, M>, size: u64, lazy_floor: u64) -> Self {
        Self {
            space,
            size,
            lazy_floor,
        }
    }

    #[must_use]
    pub const fn space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    pub const fn space_mut(&mut self) -> &mut AddressSpace<'m, M> {
        &mut self.space
    }

    /// Current byte extent of the process image.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Extend the image by `bytes` without allocating anything: the new
    /// pages materialize one fault at a time. Returns the new size.
    pub const fn grow(&mut self, bytes: u64) -> u64 {
        self.size += bytes;
        self.size
    }

    /// Shrink the image by `bytes`, unmapping and releasing every whole
    /// page above the new end. Pages never materialized are skipped.
    pub fn shrink(&mut self, frames: &CpuFrames<'_, 'm, M>, bytes: u64) -> u64 {
        let new_size = self.size.saturating_sub(bytes);
        let keep = align_up(new_size, PAGE_SIZE) / PAGE_SIZE;
        let had = align_up(self.size, PAGE_SIZE) / PAGE_SIZE;
        if had > keep {
            self.space
                .unmap(frames, VirtAddr::new(keep * PAGE_SIZE), had - keep, true);
        }
        self.size = new_size;
        new_size
    }

    /// Examine and, where possible, repair a page fault at `va`.
    ///
    /// A store into a valid copy-on-write page gets a private copy; a
    /// missing page inside the lazy range gets a zero frame. Anything else
    /// is the process's error. Running out of frames while repairing also
    /// terminates, since the faulting instruction cannot make progress.
    pub fn handle_page_fault(
        &mut self,
        frames: &CpuFrames<'_, 'm, M>,
        access: AccessKind,
        va: VirtAddr,
    ) -> FaultResolution {
        if va.as_u64() >= MAX_VA {
            warn!("page fault: {access} at {va} outside the address space");
            return FaultResolution::Terminate;
        }

        match self.space.walk(va) {
            Some(pte) if pte.valid() => {
                if pte.cow() && access == AccessKind::Store {
                    match Self::resolve_cow(frames, pte) {
                        Ok(()) => FaultResolution::Resolved,
                        Err(FrameAllocError::Exhausted) => {
                            warn!("page fault: out of frames copying {va}");
                            FaultResolution::Terminate
                        }
                    }
                } else {
                    warn!("page fault: {access} at {va} violates page permissions");
                    FaultResolution::Terminate
                }
            }
            _ => {
                if self.is_lazy(va) {
                    match self.resolve_lazy(frames, va) {
                        Ok(()) => FaultResolution::Resolved,
                        Err(FrameAllocError::Exhausted) => {
                            warn!("page fault: out of frames materializing {va}");
                            FaultResolution::Terminate
                        }
                    }
                } else {
                    warn!("page fault: {access} at {va} hits no mapping");
                    FaultResolution::Terminate
                }
            }
        }
    }

    /// Physical address backing the user address `va` for `access`,
    /// resolving a pending lazy or copy-on-write fault on the way.
    ///
    /// The kernel-side counterpart of the MMU walk: `copyin`/`copyout`
    /// style transfers go through this instead of faulting in supervisor
    /// mode. `None` means the process would have been terminated for the
    /// same access from user mode.
    pub fn user_phys_addr(
        &mut self,
        frames: &CpuFrames<'_, 'm, M>,
        access: AccessKind,
        va: VirtAddr,
    ) -> Option<PhysAddr> {
        if va.as_u64() >= MAX_VA {
            return None;
        }
        let ready = match self.space.walk(va) {
            Some(pte) if pte.valid() && pte.user() && pte.is_leaf() => match access {
                AccessKind::Load => pte.readable(),
                AccessKind::Store => pte.writable(),
                AccessKind::Instruction => pte.executable(),
            },
            _ => false,
        };
        if !ready && self.handle_page_fault(frames, access, va) == FaultResolution::Terminate {
            return None;
        }
        self.space.translate(va)
    }

    /// Fork: a child with the same bounds, sharing every materialized page
    /// copy-on-write.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if the child's tables cannot be
    /// built; no partial child survives.
    pub fn fork_into(&mut self, frames: &CpuFrames<'_, 'm, M>) -> Result<Self, FrameAllocError> {
        let mut child = AddressSpace::create(frames)?;
        match self.space.copy_into(frames, &mut child, self.size) {
            Ok(()) => Ok(Self {
                space: child,
                size: self.size,
                lazy_floor: self.lazy_floor,
            }),
            Err(e) => {
                child.destroy(frames, self.size);
                Err(e)
            }
        }
    }

    /// Tear down the whole process image.
    pub fn destroy(self, frames: &CpuFrames<'_, 'm, M>) {
        let size = self.size;
        self.space.destroy(frames, size);
    }

    /// Whether a missing page at `va` may be materialized on demand.
    const fn is_lazy(&self, va: VirtAddr) -> bool {
        va.as_u64() >= self.lazy_floor && va.as_u64() < self.size
    }

    /// Break the copy-on-write share `pte` for a store.
    ///
    /// Last reference: the share is already private, so write permission is
    /// restored in place and no frame moves. Otherwise the contents are
    /// copied into a fresh frame, the entry is switched over, and the
    /// original loses one reference. On exhaustion the entry is untouched
    /// and still consistent.
    fn resolve_cow(
        frames: &CpuFrames<'_, 'm, M>,
        pte: &mut Pte,
    ) -> Result<(), FrameAllocError> {
        let old = pte.phys_addr();
        let private = pte.flags().difference(PteFlags::COW).union(PteFlags::WRITE);

        if frames.refcount(old) == 1 {
            *pte = Pte::leaf(old, private);
            return Ok(());
        }

        let new = frames.alloc()?;
        // Safety: `new` is exclusively ours, `old` is read while its
        // mapping is still write-protected everywhere.
        unsafe {
            let src: &lark_addr::Page = page_mut(frames.mapper(), old);
            page_mut(frames.mapper(), new).copy_from(src);
        }
        *pte = Pte::leaf(new, private);
        frames.release(old);
        Ok(())
    }

    /// Materialize the promised-but-missing page containing `va` as a zero
    /// frame.
    fn resolve_lazy(
        &mut self,
        frames: &CpuFrames<'_, 'm, M>,
        va: VirtAddr,
    ) -> Result<(), FrameAllocError> {
        let pa = frames.alloc_zeroed()?;
        if let Err(e) = self
            .space
            .map(frames, va.page_base(), pa, PAGE_SIZE, LAZY_FLAGS)
        {
            frames.release(pa);
            return Err(e);
        }
        Ok(())
    }
}
