//! # Physical and Virtual Addresses
//!
//! Tiny `u64` newtypes so physical and virtual addresses cannot be mixed
//! up, page-rounding helpers, and the [`PhysMapper`] seam through which all
//! physical memory is touched.
//!
//! Nothing in the memory subsystem dereferences a physical address
//! directly: frames are reached through a [`PhysMapper`], which on the
//! running kernel is the identity map the boot code establishes over all of
//! RAM, and in the test suite is a simulated arena of 4 KiB buffers. That
//! one seam is what makes the allocator and the page-table walk testable on
//! a host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::ops::Add;
use lark_info::memory::PAGE_SIZE;

/// A **physical** memory address (a location in RAM).
///
/// Newtype over `u64` to prevent mixing with virtual addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PhysAddr(u64);

/// A **virtual** memory address (process address space).
///
/// Newtype over `u64` to prevent mixing with physical addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct VirtAddr(u64);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this address is the first byte of a frame.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// First byte of the frame containing this address.
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }
}

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// First byte of the page containing this address.
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Byte offset within the page.
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 % PAGE_SIZE
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysAddr add"))
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtAddr add"))
    }
}

impl core::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pa:0x{:012x}", self.0)
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "va:0x{:012x}", self.0)
    }
}

/// Align `x` down to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use lark_addr::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (a power of two).
///
/// `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use lark_addr::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// One frame's worth of bytes, at frame alignment.
///
/// Used wherever a whole frame is filled, scrubbed or copied: the allocator
/// writes its junk patterns through this, the fault resolver zero-fills and
/// duplicates pages through it.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE as usize]);

impl Page {
    /// Overwrite every byte of the frame.
    #[inline]
    pub fn fill(&mut self, byte: u8) {
        self.0.fill(byte);
    }

    /// Replace this frame's contents with `src`'s.
    #[inline]
    pub fn copy_from(&mut self, src: &Self) {
        self.0.copy_from_slice(&src.0);
    }
}

/// Converts physical addresses to usable references in the current virtual
/// address space.
///
/// The kernel implementation relies on the boot-time identity map of all
/// RAM; tests substitute an in-memory arena. Implementations decide the
/// translation, callers guarantee the typing.
///
/// # Safety
/// - `pa` must refer to memory the implementation can reach, mapped
///   writable for `&mut T`.
/// - `T` must match the bytes at `pa`, and callers must not create aliasing
///   `&mut` references to the same frame.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract; the returned lifetime is chosen by the
    /// caller and must not outlive the mapping.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// View the frame at `pa` as raw bytes.
///
/// # Safety
/// - `pa` must be frame-aligned and refer to a whole frame the mapper can
///   reach; no other reference to that frame may be live.
#[inline]
#[must_use]
pub unsafe fn page_mut<'a, M: PhysMapper>(m: &M, pa: PhysAddr) -> &'a mut Page {
    debug_assert!(pa.is_page_aligned());
    unsafe { m.phys_to_mut::<Page>(pa) }
}
