/// What the faulting instruction was trying to do.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessKind {
    /// A load (read) access.
    Load,
    /// A store (write) access. The only kind that can justify breaking a
    /// copy-on-write share.
    Store,
    /// An instruction fetch.
    Instruction,
}

impl AccessKind {
    /// Instruction page fault.
    const SCAUSE_FETCH: u64 = 12;
    /// Load page fault.
    const SCAUSE_LOAD: u64 = 13;
    /// Store/AMO page fault.
    const SCAUSE_STORE: u64 = 15;

    /// Decode the `scause` CSR value of a page-fault trap.
    ///
    /// `None` for any other trap cause; those belong to a different
    /// handler.
    #[must_use]
    pub const fn from_scause(scause: u64) -> Option<Self> {
        match scause {
            Self::SCAUSE_FETCH => Some(Self::Instruction),
            Self::SCAUSE_LOAD => Some(Self::Load),
            Self::SCAUSE_STORE => Some(Self::Store),
            _ => None,
        }
    }
}

impl core::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Store => "store",
            Self::Instruction => "instruction fetch",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_only_page_fault_causes() {
        assert_eq!(AccessKind::from_scause(12), Some(AccessKind::Instruction));
        assert_eq!(AccessKind::from_scause(13), Some(AccessKind::Load));
        assert_eq!(AccessKind::from_scause(15), Some(AccessKind::Store));
        // Ecall, illegal instruction, access faults: not ours.
        for cause in [2, 5, 7, 8, 14] {
            assert_eq!(AccessKind::from_scause(cause), None);
        }
    }
}
