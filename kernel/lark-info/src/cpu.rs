//! Core identity.

/// Cores the kernel is built for. Boot code parks any hart beyond this.
pub const MAX_CPUS: usize = 8;

/// Index of one core, always below [`MAX_CPUS`].
///
/// Per-CPU state (notably the frame allocator's free pools) is keyed by
/// this. The trap path obtains it once on entry and threads it through;
/// code below the trap layer never asks "which core am I" on its own.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CpuId(usize);

impl CpuId {
    /// Wrap a raw core index.
    ///
    /// # Panics
    /// If `id >= MAX_CPUS`. A hart id out of range means broken boot code.
    #[must_use]
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_CPUS, "CpuId out of range");
        Self(id)
    }

    /// The core this code is running on.
    ///
    /// On bare metal the hart id is parked in `tp` by the boot stub and
    /// stays there for the life of the kernel. Hosted builds (tests) always
    /// report core 0.
    #[must_use]
    pub fn current() -> Self {
        Self::new(raw_hart_id())
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for CpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Read the hart id from `tp`.
///
/// Only meaningful with interrupts disabled or from a context that cannot
/// migrate; callers hold an interrupt guard for the duration of any use.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn raw_hart_id() -> usize {
    let id: usize;
    unsafe {
        core::arch::asm!("mv {}, tp", out(reg) id, options(nomem, nostack, preserves_flags));
    }
    id
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[inline]
const fn raw_hart_id() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_in_range() {
        assert!(CpuId::current().as_usize() < MAX_CPUS);
    }

    #[test]
    #[should_panic(expected = "CpuId out of range")]
    fn out_of_range_rejected() {
        let _ = CpuId::new(MAX_CPUS);
    }
}
