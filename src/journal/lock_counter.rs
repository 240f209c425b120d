//! Per-journal-block reference counting, split by the two independent
//! zone kinds (logical, physical) that can each hold a block locked.
//! A block cannot be reaped until both kinds have released it; the two
//! counts are tracked separately so that released-per-zone-type does
//! not require visiting every zone to know "is this block still
//! locked at all".

use std::collections::HashMap;

use crate::types::{SequenceNumber, ZoneType};

#[derive(Default, Clone, Copy, Debug)]
struct Counts {
    logical: u32,
    physical: u32,
}

impl Counts {
    fn is_zero(self) -> bool {
        self.logical == 0 && self.physical == 0
    }
}

/// Tracks, per journal block (identified by its sequence number), how
/// many logical-zone and physical-zone locks are still outstanding
/// against it.
#[derive(Default)]
pub struct LockCounter {
    counts: HashMap<SequenceNumber, Counts>,
}

impl LockCounter {
    pub fn new() -> Self {
        Self { counts: HashMap::new() }
    }

    pub fn acquire(&mut self, sequence_number: SequenceNumber, zone_type: ZoneType) {
        let entry = self.counts.entry(sequence_number).or_default();
        match zone_type {
            ZoneType::Logical => entry.logical += 1,
            ZoneType::Physical => entry.physical += 1,
        }
    }

    /// Release one lock of `zone_type` on `sequence_number`. Returns
    /// `true` if this release brought the block's combined count to
    /// zero (i.e. it may now be reaped), `false` otherwise.
    pub fn release(&mut self, sequence_number: SequenceNumber, zone_type: ZoneType) -> bool {
        let now_zero = match self.counts.get_mut(&sequence_number) {
            Some(entry) => {
                match zone_type {
                    ZoneType::Logical => entry.logical = entry.logical.saturating_sub(1),
                    ZoneType::Physical => entry.physical = entry.physical.saturating_sub(1),
                }
                entry.is_zero()
            }
            None => true,
        };
        if now_zero {
            self.counts.remove(&sequence_number);
        }
        now_zero
    }

    pub fn is_locked(&self, sequence_number: SequenceNumber) -> bool {
        self.counts.get(&sequence_number).map_or(false, |c| !c.is_zero())
    }

    /// True if `sequence_number` still has an outstanding lock held by
    /// `zone_type` specifically. The two reap heads each consult only
    /// their own zone type here - a block-map head must never be
    /// blocked by an outstanding *physical*-zone lock, and vice versa.
    pub fn is_locked_by(&self, sequence_number: SequenceNumber, zone_type: ZoneType) -> bool {
        self.counts.get(&sequence_number).map_or(false, |c| match zone_type {
            ZoneType::Logical => c.logical != 0,
            ZoneType::Physical => c.physical != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_locked_until_both_zone_kinds_release() {
        let mut counter = LockCounter::new();
        counter.acquire(10, ZoneType::Logical);
        counter.acquire(10, ZoneType::Physical);
        assert!(counter.is_locked(10));

        assert!(!counter.release(10, ZoneType::Logical));
        assert!(counter.is_locked(10));

        assert!(counter.release(10, ZoneType::Physical));
        assert!(!counter.is_locked(10));
    }

    #[test]
    fn releasing_an_untracked_block_reports_zero() {
        let mut counter = LockCounter::new();
        assert!(counter.release(5, ZoneType::Logical));
        assert!(!counter.is_locked(5));
    }

    #[test]
    fn is_locked_by_tracks_each_zone_kind_independently() {
        let mut counter = LockCounter::new();
        counter.acquire(10, ZoneType::Physical);
        assert!(!counter.is_locked_by(10, ZoneType::Logical));
        assert!(counter.is_locked_by(10, ZoneType::Physical));

        counter.release(10, ZoneType::Physical);
        assert!(!counter.is_locked_by(10, ZoneType::Physical));
    }
}
