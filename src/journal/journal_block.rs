//! In-memory accumulator for one on-disk journal block: a fixed-size
//! batch of entries that fills up, gets written out together, and is
//! reclaimable once every data_vio it locked has released that lock.

use crate::types::{JournalPoint, SequenceNumber};
use crate::vio::{JournalEntry, VioId};

/// One journal block's worth of pending entries, not yet (or just)
/// written. `capacity` is the journal's fixed entries-per-block.
pub struct JournalBlock {
    pub sequence_number: SequenceNumber,
    capacity: usize,
    entries: Vec<(JournalPoint, JournalEntry, VioId)>,
    /// How many of `entries`, counted from the front, are already
    /// known to be durably written. A write policy that flushes after
    /// every entry (SYNC) advances this on every `mark_committed`
    /// call; one that batches (ASYNC) only advances it on roll-over.
    committed_len: usize,
}

impl JournalBlock {
    pub fn new(sequence_number: SequenceNumber, capacity: usize) -> Self {
        Self { sequence_number, capacity, entries: Vec::with_capacity(capacity), committed_len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn is_committed(&self) -> bool {
        !self.entries.is_empty() && self.committed_len >= self.entries.len()
    }

    /// Has entries that have not yet been written out.
    pub fn is_dirty(&self) -> bool {
        self.committed_len < self.entries.len()
    }

    pub fn can_commit(&self) -> bool {
        self.is_dirty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append `entry` on behalf of `vio`, returning the journal point
    /// it was assigned. Panics if the block is already full; callers
    /// must check `is_full` before calling (a recovery journal never
    /// assigns an entry to a full block - it starts a new one first).
    pub fn enqueue_entry(&mut self, vio: VioId, entry: JournalEntry) -> JournalPoint {
        assert!(!self.is_full(), "journal block {} is full", self.sequence_number);
        let point = JournalPoint::new(self.sequence_number, self.entries.len() as u16);
        self.entries.push((point, entry, vio));
        point
    }

    /// Mark every entry currently in the block as durably written.
    /// Idempotent; entries enqueued after this call are dirty again.
    pub fn mark_committed(&mut self) {
        self.committed_len = self.entries.len();
    }

    pub fn entries(&self) -> impl Iterator<Item = &(JournalPoint, JournalEntry, VioId)> {
        self.entries.iter()
    }

    pub fn vios(&self) -> impl Iterator<Item = VioId> + '_ {
        self.entries.iter().map(|(_, _, vio)| *vio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JournalOperation;

    fn entry() -> JournalEntry {
        JournalEntry { operation: JournalOperation::DataIncrement, pbn: 1, mapping: None }
    }

    #[test]
    fn fills_up_and_assigns_sequential_entry_counts() {
        let mut block = JournalBlock::new(4, 2);
        let p0 = block.enqueue_entry(VioId(1), entry());
        let p1 = block.enqueue_entry(VioId(2), entry());
        assert_eq!(p0.entry_count, 0);
        assert_eq!(p1.entry_count, 1);
        assert!(block.is_full());
    }

    #[test]
    fn commit_clears_dirty_but_keeps_entries() {
        let mut block = JournalBlock::new(1, 8);
        block.enqueue_entry(VioId(1), entry());
        assert!(block.can_commit());
        block.mark_committed();
        assert!(!block.can_commit());
        assert_eq!(block.len(), 1);
    }
}
