// state.rs: Persistent state slots: compile-time allocation and runtime arena
//
// `StateAllocator` gives every stateful node one module-scope buffer, named
// after the node id, during lowering. `StateArena` is the host-side storage a
// pattern instance owns: one zero-initialized `f32` buffer per slot that lives
// for as long as the instance and only changes when its owner runs.
//
// Preconditions: owners are unique node ids (guaranteed by graph loading).
// Postconditions: slot symbols are unique, valid C identifiers, assigned in
//   lowering order (top-level chain, then a conditional's primary branch
//   before its fallback list).
// Failure modes: none.
// Side effects: none.

use std::collections::HashSet;

use crate::id::SlotId;
use crate::lir::LirSlot;

// ── Compile-time allocation ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StateAllocator {
    slots: Vec<LirSlot>,
    symbols: HashSet<String>,
}

impl StateAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot of `len` floats owned by node `owner`.
    pub fn allocate(&mut self, id: SlotId, owner: &str, len: usize) -> &LirSlot {
        let base = format!("state_{}", sanitize(owner));
        let mut symbol = base.clone();
        let mut n = 2;
        while self.symbols.contains(&symbol) {
            symbol = format!("{}_{}", base, n);
            n += 1;
        }
        self.symbols.insert(symbol.clone());
        tracing::trace!(slot = id.0, %owner, %symbol, len, "state slot allocated");
        self.slots.push(LirSlot {
            symbol,
            owner: owner.to_string(),
            len,
        });
        &self.slots[self.slots.len() - 1]
    }

    pub fn into_slots(self) -> Vec<LirSlot> {
        self.slots
    }
}

/// Map a node id onto a C identifier fragment.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ── Runtime arena ───────────────────────────────────────────────────────────

/// Persistent buffers of one pattern instance, keyed by owner.
#[derive(Debug, Default, Clone)]
pub struct StateArena {
    slots: Vec<(String, Vec<f32>)>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `owner`'s buffer, creating a zeroed one of `len` on first use.
    pub fn ensure(&mut self, owner: &str, len: usize) -> usize {
        if let Some(idx) = self.position(owner) {
            return idx;
        }
        self.slots.push((owner.to_string(), vec![0.0; len]));
        self.slots.len() - 1
    }

    pub fn position(&self, owner: &str) -> Option<usize> {
        self.slots.iter().position(|(o, _)| o == owner)
    }

    pub fn get(&self, owner: &str) -> Option<&[f32]> {
        self.position(owner).map(|idx| self.slots[idx].1.as_slice())
    }

    pub fn data(&self, idx: usize) -> &[f32] {
        &self.slots[idx].1
    }

    pub fn data_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.slots[idx].1
    }

    pub fn owner(&self, idx: usize) -> &str {
        &self.slots[idx].0
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Zero every buffer. Allocation is kept.
    pub fn reset(&mut self) {
        for (_, data) in &mut self.slots {
            data.iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdAllocator;

    #[test]
    fn symbols_follow_node_ids() {
        let mut ids = IdAllocator::new();
        let mut alloc = StateAllocator::new();
        assert_eq!(alloc.allocate(ids.alloc_slot(), "decay", 8).symbol, "state_decay");
        assert_eq!(alloc.allocate(ids.alloc_slot(), "glow-2", 4).symbol, "state_glow_2");
        let slots = alloc.into_slots();
        assert_eq!(slots[1].owner, "glow-2");
        assert_eq!(slots[1].len, 4);
    }

    #[test]
    fn colliding_symbols_get_suffixes() {
        let mut ids = IdAllocator::new();
        let mut alloc = StateAllocator::new();
        alloc.allocate(ids.alloc_slot(), "a-b", 2);
        assert_eq!(alloc.allocate(ids.alloc_slot(), "a_b", 2).symbol, "state_a_b_2");
        assert_eq!(alloc.allocate(ids.alloc_slot(), "a.b", 2).symbol, "state_a_b_3");
    }

    #[test]
    fn arena_zero_initializes_and_resets() {
        let mut arena = StateArena::new();
        let idx = arena.ensure("decay", 3);
        assert_eq!(arena.get("decay"), Some(&[0.0, 0.0, 0.0][..]));
        arena.data_mut(idx)[1] = 0.5;
        assert_eq!(arena.ensure("decay", 3), idx);
        assert_eq!(arena.data(idx)[1], 0.5);
        arena.reset();
        assert_eq!(arena.get("decay"), Some(&[0.0, 0.0, 0.0][..]));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.owner(idx), "decay");
        assert!(arena.get("other").is_none());
    }
}
