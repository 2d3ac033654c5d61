//! RAII interrupt masking.
//!
//! The frame allocator disables interrupts for the whole of every
//! allocate/release sequence: a timer interrupt between "my pool is empty"
//! and "steal from a neighbour" could otherwise reschedule the thread onto
//! another core mid-sequence, or re-enter the allocator from a handler
//! while a pool lock is held.

/// RAII guard that disables supervisor interrupts on creation and restores
/// the previous state on drop.
///
/// Snapshots `sstatus.SIE` and clears it; on drop, sets it again **only**
/// if it was set before, so nested guards compose.
///
/// # Platform
///
/// Bare-metal riscv64 uses the `sstatus` CSR. Hosted builds (the test
/// suite) have no interrupt state; there the guard is a no-op marker.
pub struct IrqGuard {
    /// Whether SIE was set when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disable interrupts if they are currently enabled, remembering the
    /// prior state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: disable_interrupts(),
        }
    }
}

impl Drop for IrqGuard {
    /// Re-enable interrupts only if they were enabled before the guard.
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

/// `sstatus.SIE`, supervisor interrupt enable.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SSTATUS_SIE: usize = 1 << 1;

/// Clear `sstatus.SIE`, returning whether it was set.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn disable_interrupts() -> bool {
    let prev: usize;
    unsafe {
        core::arch::asm!(
            "csrrc {}, sstatus, {}",
            out(reg) prev,
            in(reg) SSTATUS_SIE,
            options(nostack, preserves_flags),
        );
    }
    prev & SSTATUS_SIE != 0
}

/// Set `sstatus.SIE`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn enable_interrupts() {
    unsafe {
        core::arch::asm!(
            "csrs sstatus, {}",
            in(reg) SSTATUS_SIE,
            options(nostack, preserves_flags),
        );
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[inline]
const fn disable_interrupts() -> bool {
    false
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[inline]
const fn enable_interrupts() {}
