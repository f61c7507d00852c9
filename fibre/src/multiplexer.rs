//! Frame-level egress plumbing. A `FrameStreamSink` is the transport-facing
//! contract for anything that can emit one frame at a time (a CAN mailbox,
//! a UDP socket). The multiplexer tracks which sources currently have data
//! and hands them to the sink one frame per pump step.

use indexmap::IndexSet;
use std::hash::Hash;

use crate::chunk::ChainPos;
use crate::connection::TxTask;
use crate::domain::NodeId;

/// Transport-facing frame sink. Implementations own the per-destination
/// back-end slots (mailboxes) and the physical write path.
pub trait FrameStreamSink {
    /// Allocates a back-end slot addressed to a destination node. Slot count
    /// per destination is bounded; `None` when exhausted.
    fn open_output_slot(&mut self, dest: &NodeId) -> Option<u64>;

    fn close_output_slot(&mut self, slot_id: u64) -> bool;

    /// Begins transmission of one frame built from the front task. Returns
    /// how far the task chain was consumed, or `None` when the sink cannot
    /// take a frame right now. The chain stays owned by the source; the
    /// caller must report the consumed end back to it.
    fn start_write(&mut self, tasks: &mut [TxTask<'_>]) -> Option<ChainPos>;

    fn cancel_write(&mut self);
}

/// Keeps the set of sources that currently have a frame to contribute.
/// Sources are identified by copyable keys, not references; whoever owns
/// both sides resolves a popped key back to its connection slot. Insertion
/// order is kept so service is round-robin-ish, but no fairness stronger
/// than "a ready source is eventually served" is guaranteed.
pub struct Multiplexer<K: Copy + Eq + Hash> {
    sources: IndexSet<K>,
}

impl<K: Copy + Eq + Hash> Multiplexer<K> {
    pub fn new() -> Multiplexer<K> {
        Multiplexer {
            sources: IndexSet::new(),
        }
    }

    /// Registers a source. Idempotent.
    pub fn add_source(&mut self, key: K) {
        self.sources.insert(key);
    }

    /// Removes a source that ran dry (or whose owner went away).
    pub fn remove_source(&mut self, key: K) {
        self.sources.shift_remove(&key);
    }

    /// Takes the next source to be serviced. The caller re-adds it after the
    /// pump step if it still has data.
    pub fn pop_source(&mut self) -> Option<K> {
        self.sources.shift_remove_index(0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl<K: Copy + Eq + Hash> Default for Multiplexer<K> {
    fn default() -> Self {
        Multiplexer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut mux: Multiplexer<u32> = Multiplexer::new();

        mux.add_source(7);
        mux.add_source(7);
        mux.add_source(9);

        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn test_pop_preserves_insertion_order() {
        let mut mux: Multiplexer<u32> = Multiplexer::new();

        mux.add_source(3);
        mux.add_source(1);
        mux.add_source(2);

        assert_eq!(mux.pop_source(), Some(3));
        assert_eq!(mux.pop_source(), Some(1));
        assert_eq!(mux.pop_source(), Some(2));
        assert_eq!(mux.pop_source(), None);
    }

    #[test]
    fn test_remove_missing_is_harmless() {
        let mut mux: Multiplexer<u32> = Multiplexer::new();

        mux.add_source(1);
        mux.remove_source(99);

        assert_eq!(mux.len(), 1);
    }
}
