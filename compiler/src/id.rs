// id.rs: Stable identifiers for lowered buffers
//
// Allocated in lowering order, so the same graph always yields the same ids.
// They label buffers in trace output only; emitted symbols come from node
// ids (`state_<id>`) and per-type temp counters (`tmp_fN`, `tmp_rgbN`).

/// Stable identifier for a per-call temporary buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(pub u32);

/// Stable identifier for a persistent state slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_temp: u32,
    next_slot: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_temp(&mut self) -> TempId {
        let id = TempId(self.next_temp);
        self.next_temp += 1;
        id
    }

    pub fn alloc_slot(&mut self) -> SlotId {
        let id = SlotId(self.next_slot);
        self.next_slot += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_per_kind() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_temp(), TempId(0));
        assert_eq!(ids.alloc_slot(), SlotId(0));
        assert_eq!(ids.alloc_temp(), TempId(1));
        assert_eq!(ids.alloc_slot(), SlotId(1));
    }
}
