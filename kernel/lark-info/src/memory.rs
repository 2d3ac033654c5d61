//! # Memory Layout
//!
//! Physical memory on the target board starts at [`RAM_BASE`] and runs to
//! [`PHYS_CEILING`]. The kernel image is loaded at `RAM_BASE`; everything
//! between the end of the image and the ceiling belongs to the frame
//! allocator.

/// One page/frame, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Entries per page-table node (9 index bits per level).
pub const PT_ENTRIES: usize = 512;

/// Number of page-table levels in the Sv39 scheme.
pub const PT_LEVELS: usize = 3;

/// First byte of physical RAM; also where the kernel image is loaded.
pub const RAM_BASE: u64 = 0x8000_0000;

/// One byte past the last usable physical address (128 MiB of RAM).
pub const PHYS_CEILING: u64 = RAM_BASE + 128 * 1024 * 1024;

/// First frame past the kernel image.
///
/// # Kernel Build
/// On hardware this comes from the `end` symbol in the linker script; the
/// constant here matches the default script's worst-case image size.
pub const KERNEL_IMAGE_END: u64 = 0x8020_0000;

/// One past the largest legal virtual address.
///
/// Sv39 gives 39 bits of VA, but bit 38 is left unused so that addresses
/// with bit 38 set stay out of reach of the sign-extension hole in the
/// middle of the canonical range.
pub const MAX_VA: u64 = 1 << (9 + 9 + 9 + PAGE_SHIFT - 1);

/// Slots in the frame reference-count table: one per frame of RAM.
///
/// Sized once from the physical ceiling; the table never grows.
pub const FRAME_CAPACITY: usize = ((PHYS_CEILING - RAM_BASE) / PAGE_SIZE) as usize;

const _: () = {
    assert!(RAM_BASE % PAGE_SIZE == 0);
    assert!(PHYS_CEILING % PAGE_SIZE == 0);
    assert!(KERNEL_IMAGE_END % PAGE_SIZE == 0);
    assert!(RAM_BASE < KERNEL_IMAGE_END && KERNEL_IMAGE_END < PHYS_CEILING);
    assert!(MAX_VA == 1 << 38);
    assert!(FRAME_CAPACITY == 32768);
};
