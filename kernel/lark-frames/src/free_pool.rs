use lark_addr::{PhysAddr, PhysMapper};

/// Link word stored in the first 8 bytes of every **free** frame.
///
/// Free frames carry the list through their own memory, so the pool itself
/// is just a head pointer. `0` terminates the list; no frame the allocator
/// manages lives at physical address 0.
#[repr(C)]
struct FreeNode {
    next: u64,
}

/// One CPU's stack of free frames.
///
/// # Invariants
/// - Every linked frame is page-aligned and inside the managed region.
/// - A frame appears on at most one pool, and only while its reference
///   count is 0.
pub(crate) struct FreePool {
    /// Physical address of the most recently freed frame, or 0.
    head: u64,
    /// Frames currently on this list.
    len: usize,
}

impl FreePool {
    pub(crate) const fn new() -> Self {
        Self { head: 0, len: 0 }
    }

    /// Push `pa` onto the list, writing the link word into the frame.
    pub(crate) fn push<M: PhysMapper>(&mut self, mapper: &M, pa: PhysAddr) {
        debug_assert!(pa.is_page_aligned());
        // Safety: the caller owns the frame (count 0, off every list) and
        // the mapper reaches all managed RAM.
        let node = unsafe { mapper.phys_to_mut::<FreeNode>(pa) };
        node.next = self.head;
        self.head = pa.as_u64();
        self.len += 1;
    }

    /// Pop the most recently freed frame, if any.
    pub(crate) fn pop<M: PhysMapper>(&mut self, mapper: &M) -> Option<PhysAddr> {
        if self.head == 0 {
            return None;
        }
        let pa = PhysAddr::new(self.head);
        // Safety: `pa` came off this list, so it is a valid free frame.
        let node = unsafe { mapper.phys_to_mut::<FreeNode>(pa) };
        self.head = node.next;
        self.len -= 1;
        Some(pa)
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }
}
