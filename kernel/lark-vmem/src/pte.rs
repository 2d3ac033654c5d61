use bitfield_struct::bitfield;
use lark_addr::PhysAddr;

bitflags::bitflags! {
    /// Sv39 page-table entry flags.
    ///
    /// Bits 0–7 are defined by the hardware; bit 8 is the first of the two
    /// RSW (reserved-for-software) bits, which the MMU ignores and the
    /// kernel uses to tag copy-on-write pages.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PteFlags: u64 {
        /// Entry is live. Clear means the whole entry is ignored and any
        /// access through it faults.
        const VALID    = 1 << 0;

        /// Loads allowed through this mapping.
        const READ     = 1 << 1;

        /// Stores allowed. Cleared (with [`COW`](Self::COW) set) on every
        /// page shared by a fork, so the first store faults.
        const WRITE    = 1 << 2;

        /// Instruction fetches allowed.
        const EXECUTE  = 1 << 3;

        /// Accessible from user mode. The kernel's own mappings leave this
        /// clear; translation of user buffers requires it.
        const USER     = 1 << 4;

        /// Translation survives an address-space switch in the TLB.
        const GLOBAL   = 1 << 5;

        /// Set by hardware on first access through the entry.
        const ACCESSED = 1 << 6;

        /// Set by hardware on first store through the entry.
        const DIRTY    = 1 << 7;

        /// Software: page is a shared copy-on-write original. Always
        /// paired with a cleared [`WRITE`](Self::WRITE); the store fault
        /// resolver turns the pair back into a private writable page.
        const COW      = 1 << 8;
    }
}

/// One Sv39 page-table entry in its raw 64-bit form.
///
/// An entry either points at a next-level table (**branch**: valid with no
/// permission bits) or maps a frame (**leaf**: valid with at least one of
/// R/W/X). The physical frame number sits in bits 10–53.
///
/// | Bits  | Field | Meaning                                    |
/// |-------|-------|--------------------------------------------|
/// | 0     | `V`   | Valid                                      |
/// | 1–3   | `RWX` | Read / write / execute (all 0 ⇒ branch)    |
/// | 4     | `U`   | User accessible                            |
/// | 5     | `G`   | Global                                     |
/// | 6–7   | `A/D` | Accessed / dirty                           |
/// | 8–9   | RSW   | Software; bit 8 tags copy-on-write         |
/// | 10–53 | PPN   | Physical frame number (`pa >> 12`)         |
/// | 54–63 | —     | Reserved, must be zero                     |
#[bitfield(u64)]
pub struct Pte {
    pub valid: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// RSW bit 8: copy-on-write tag.
    pub cow: bool,
    /// RSW bit 9, unused.
    _rsw: bool,
    /// Physical frame number, bits [53:12] of the frame address.
    #[bits(44)]
    ppn: u64,
    #[bits(10)]
    _reserved: u16,
}

impl Pte {
    /// A leaf entry mapping `pa` with `flags`. `VALID` is implied.
    #[must_use]
    pub const fn leaf(pa: PhysAddr, flags: PteFlags) -> Self {
        Self::from_bits(flags.union(PteFlags::VALID).bits())
            .with_ppn(pa.as_u64() >> 12)
    }

    /// A branch entry pointing at the next-level table frame `child`.
    ///
    /// Branches carry no permission bits; permissions live in the leaf
    /// alone.
    #[must_use]
    pub const fn branch(child: PhysAddr) -> Self {
        Self::from_bits(PteFlags::VALID.bits()).with_ppn(child.as_u64() >> 12)
    }

    /// The frame this entry points at (leaf: the mapped frame; branch: the
    /// child table).
    #[must_use]
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr::new(self.ppn() << 12)
    }

    /// Flag view of the low bits.
    #[must_use]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.into_bits())
    }

    /// A valid entry with any of R/W/X maps a frame; without, it points at
    /// a table.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.readable() || self.writable() || self.executable()
    }
}
