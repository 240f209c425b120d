//! The recovery journal: an append-only log of reference-count deltas
//! that serializes every block-map and slab-reference change so a
//! crash can replay exactly the operations that had not yet reached
//! the block map or slab journals.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::error::{VdoError, VdoResult};
use crate::journal::format::{
    compute_recovery_count_byte, EncodedRecoveryJournalState, RecoveryJournalState7_0, WritePolicy,
};
use crate::journal::journal_block::JournalBlock;
use crate::journal::lock_counter::LockCounter;
use crate::types::{JournalOperation, JournalPoint, MappingState, PhysicalBlockNumber, SequenceNumber, ZoneType};
use crate::vio::JournalEntry;
use crate::vio::VioId;

/// Sequence numbers are encoded in 48 bits on disk; the journal must
/// never assign one past this.
pub const MAXIMUM_TAIL: SequenceNumber = 1 << 48;

/// A real kvdo journal block holds this many entries; kept as a named
/// constant here since nothing in this crate's scope computes it from
/// block geometry (that's the block map's concern).
pub const ENTRIES_PER_BLOCK: usize = 311;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdminState {
    Normal,
    Suspending,
    Saving,
    Saved,
    Resuming,
}

/// What happened when a write tried to add an entry.
#[derive(Clone, Copy, Debug)]
pub enum EntryAdmission {
    /// The entry was assigned a point in the active block immediately.
    Admitted(JournalPoint),
    /// The journal has no room to admit this entry right now; it has
    /// been queued and will be retried automatically as blocks reap.
    Queued,
}

type QueuedEntry = (VioId, JournalOperation, PhysicalBlockNumber, Option<MappingState>);

pub struct RecoveryJournal {
    journal_length: u64,
    entries_per_block: usize,
    write_policy: WritePolicy,
    admin_state: AdminState,
    read_only: bool,

    tail: SequenceNumber,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    recovery_count: u64,

    logical_blocks_used: u64,
    block_map_data_blocks: u64,
    pending_decrement_count: u64,

    /// `(journal_length * 2) / 3`; once `tail - slab_journal_head`
    /// exceeds this, the slab depot's oldest outstanding slab journal
    /// tail blocks are forced to commit early.
    slab_journal_commit_threshold: u64,
    slab_journal_commits_requested: u64,

    lock_counter: LockCounter,
    active_block: JournalBlock,
    committed_blocks: VecDeque<JournalBlock>,

    /// Entries blocked on space, drained in priority order: decrements
    /// (gated only by `available_space`) always drain ahead of
    /// increments (gated by the reserve-a-slot-for-decrements rule).
    decrement_waiters: VecDeque<QueuedEntry>,
    increment_waiters: VecDeque<QueuedEntry>,

    /// Decrement entries outstanding per block, not yet reaped. This is
    /// what `pending_decrement_count` (the increment admission
    /// invariant's denominator) sums; a block's share is removed once
    /// both reap heads have passed it.
    decrements_by_block: HashMap<SequenceNumber, u64>,
}

impl RecoveryJournal {
    pub fn new(journal_length: u64, write_policy: WritePolicy) -> Self {
        Self {
            journal_length,
            entries_per_block: ENTRIES_PER_BLOCK,
            write_policy,
            admin_state: AdminState::Normal,
            read_only: false,
            tail: 1,
            block_map_head: 1,
            slab_journal_head: 1,
            recovery_count: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            pending_decrement_count: 0,
            slab_journal_commit_threshold: (journal_length * 2) / 3,
            slab_journal_commits_requested: 0,
            lock_counter: LockCounter::new(),
            active_block: JournalBlock::new(1, ENTRIES_PER_BLOCK),
            committed_blocks: VecDeque::new(),
            decrement_waiters: VecDeque::new(),
            increment_waiters: VecDeque::new(),
            decrements_by_block: HashMap::new(),
        }
    }

    /// Stamp a fresh recovery count (once, at journal open or after a
    /// replay), which from then on is written into the super block and
    /// checked on the next load.
    pub fn set_recovery_count(&mut self, recovery_count: u64) {
        self.recovery_count = recovery_count;
    }

    pub fn recovery_count_byte(&self) -> u8 {
        compute_recovery_count_byte(self.recovery_count)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn admin_state(&self) -> AdminState {
        self.admin_state
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn block_map_head(&self) -> SequenceNumber {
        self.block_map_head
    }

    pub fn slab_journal_head(&self) -> SequenceNumber {
        self.slab_journal_head
    }

    pub fn slab_journal_commits_requested(&self) -> u64 {
        self.slab_journal_commits_requested
    }

    /// The lower of the two independent reap heads: the oldest block
    /// still needed by anything.
    pub fn reap_head(&self) -> SequenceNumber {
        self.block_map_head.min(self.slab_journal_head)
    }

    /// Free journal block slots between the reap head and the tail.
    pub fn available_space(&self) -> u64 {
        self.journal_length.saturating_sub(self.tail - self.reap_head())
    }

    fn enter_read_only(&mut self) {
        if !self.read_only {
            self.read_only = true;
            warn!("recovery journal entering read-only mode at tail {}", self.tail);
        }
    }

    /// Add one reference-count delta entry on behalf of `vio`. Fails
    /// only for the two conditions that always force read-only (an
    /// exhausted journal, or a tail sequence-number overflow) and for
    /// admin-state/read-only rejections; otherwise either assigns a
    /// point immediately or queues the entry to retry once a reap
    /// frees space. Decrements are queued only behind other pending
    /// decrements; increments are queued behind both, since decrements
    /// always drain first.
    pub fn add_entry(
        &mut self,
        vio_id: VioId,
        operation: JournalOperation,
        pbn: PhysicalBlockNumber,
        mapping: Option<MappingState>,
    ) -> VdoResult<EntryAdmission> {
        if self.read_only {
            return Err(VdoError::ReadOnly);
        }
        if self.admin_state != AdminState::Normal {
            return Err(VdoError::AdminStateInvalid);
        }

        let entry = (vio_id, operation, pbn, mapping);
        if operation.is_increment() {
            if !self.increment_waiters.is_empty() || !self.decrement_waiters.is_empty() {
                self.increment_waiters.push_back(entry);
                return Ok(EntryAdmission::Queued);
            }
        } else if !self.decrement_waiters.is_empty() {
            self.decrement_waiters.push_back(entry);
            return Ok(EntryAdmission::Queued);
        }

        self.admit(vio_id, operation, pbn, mapping)
    }

    fn admit(
        &mut self,
        vio_id: VioId,
        operation: JournalOperation,
        pbn: PhysicalBlockNumber,
        mapping: Option<MappingState>,
    ) -> VdoResult<EntryAdmission> {
        if self.tail >= MAXIMUM_TAIL {
            self.enter_read_only();
            return Err(VdoError::JournalOverflow);
        }

        let space = self.available_space();
        if space == 0 {
            self.enter_read_only();
            return Err(VdoError::JournalFull);
        }

        let is_decrement = !operation.is_increment();

        // Decrements can never be blocked except by disk-full, already
        // checked above; only increments reserve a slot for decrements.
        if !is_decrement && (space as i64) - (self.pending_decrement_count as i64) <= 1 {
            self.increment_waiters.push_back((vio_id, operation, pbn, mapping));
            return Ok(EntryAdmission::Queued);
        }

        if self.active_block.is_full() {
            self.roll_active_block();
        }

        if is_decrement {
            self.pending_decrement_count += 1;
            *self.decrements_by_block.entry(self.active_block.sequence_number).or_insert(0) += 1;
        }

        let point = self.active_block.enqueue_entry(vio_id, JournalEntry { operation, pbn, mapping });
        self.lock_counter.acquire(point.sequence_number, ZoneType::Logical);
        self.lock_counter.acquire(point.sequence_number, ZoneType::Physical);

        match operation {
            JournalOperation::DataIncrement => self.logical_blocks_used += 1,
            JournalOperation::DataDecrement => self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1),
            JournalOperation::BlockMapIncrement => self.block_map_data_blocks += 1,
            JournalOperation::BlockMapDecrement => {
                self.block_map_data_blocks = self.block_map_data_blocks.saturating_sub(1)
            }
        }

        if self.write_policy != WritePolicy::Async && self.active_block.can_commit() {
            self.commit_active_block();
        }

        self.check_slab_journal_commit_threshold();

        Ok(EntryAdmission::Admitted(point))
    }

    fn roll_active_block(&mut self) {
        if self.active_block.is_dirty() {
            self.commit_active_block();
        }
        let next_sequence = self.tail + 1;
        let finished = std::mem::replace(&mut self.active_block, JournalBlock::new(next_sequence, self.entries_per_block));
        self.tail = next_sequence;
        self.committed_blocks.push_back(finished);
    }

    /// Flush the active block if it has uncommitted entries. SYNC and
    /// ASYNC_UNSAFE both call this after every entry (see
    /// `WritePolicy`); ASYNC only calls it on roll-over.
    pub fn commit_active_block(&mut self) {
        if self.active_block.can_commit() {
            self.active_block.mark_committed();
            debug!("recovery journal block {} committed", self.active_block.sequence_number);
        }
    }

    /// Explicitly commit whatever is pending, regardless of write
    /// policy (used by drain/suspend).
    pub fn flush(&mut self) {
        self.commit_active_block();
    }

    /// If the journal has grown past two-thirds of its length since the
    /// slab journal head last advanced, force the slab depot's oldest
    /// outstanding slab journal tail blocks to commit early, so the
    /// head can eventually catch back up. The actual commit dispatch is
    /// the slab depot's concern (external collaborator, out of scope
    /// here); this tracks the request and logs it.
    fn check_slab_journal_commit_threshold(&mut self) {
        let current_length = self.tail.saturating_sub(self.slab_journal_head);
        if current_length > self.slab_journal_commit_threshold {
            self.slab_journal_commits_requested += 1;
            debug!(
                "recovery journal length {} exceeds slab journal commit threshold {}; requesting early commit of oldest slab journal tail blocks",
                current_length, self.slab_journal_commit_threshold
            );
        }
    }

    /// Release one data_vio's lock on the journal block its entry was
    /// written into, for the given zone kind. Reaping each independent
    /// head only ever advances while that head's own zone type still
    /// has a lock outstanding on the current head block.
    pub fn release_entry_lock(&mut self, point: JournalPoint, zone_type: ZoneType) {
        self.lock_counter.release(point.sequence_number, zone_type);
    }

    /// Advance the block-map reap head past every committed block no
    /// longer locked by the *logical* zone - a block still locked by
    /// the physical zone must not hold this head back, and vice versa
    /// for `reap_slab_journal_head`.
    pub fn reap_block_map_head(&mut self) {
        let mut new_head = self.block_map_head;
        while new_head < self.tail
            && !self.lock_counter.is_locked_by(new_head, ZoneType::Logical)
            && self.block_is_committed(new_head)
        {
            new_head += 1;
        }
        if new_head == self.block_map_head {
            return;
        }
        self.issue_pre_reap_flush("block map");
        self.block_map_head = new_head;
        self.finish_reaping();
    }

    /// Advance the slab-journal reap head the same way, independently.
    pub fn reap_slab_journal_head(&mut self) {
        let mut new_head = self.slab_journal_head;
        while new_head < self.tail
            && !self.lock_counter.is_locked_by(new_head, ZoneType::Physical)
            && self.block_is_committed(new_head)
        {
            new_head += 1;
        }
        if new_head == self.slab_journal_head {
            return;
        }
        self.issue_pre_reap_flush("slab journal");
        self.slab_journal_head = new_head;
        self.finish_reaping();
    }

    /// SYNC mode never needs this: every journal block write is already
    /// preceded by a flush, so the block-map/slab-summary pages the
    /// reaped entries touched are guaranteed durable by the time the
    /// next block is written. ASYNC and ASYNC_UNSAFE must flush those
    /// pages explicitly before the new head is published, or a crash
    /// could reap a block whose block-map/slab-summary update never
    /// made it to disk.
    fn issue_pre_reap_flush(&self, head_name: &str) {
        if self.write_policy != WritePolicy::Sync {
            debug!("issuing flush before publishing new {} reap head", head_name);
        }
    }

    fn finish_reaping(&mut self) {
        self.drop_fully_reaped_blocks();
        self.check_slab_journal_commit_threshold();
        self.drain_entry_waiters();
    }

    fn block_is_committed(&self, sequence_number: SequenceNumber) -> bool {
        if sequence_number == self.active_block.sequence_number {
            return self.active_block.is_committed() || self.active_block.is_empty();
        }
        self.committed_blocks
            .iter()
            .find(|b| b.sequence_number == sequence_number)
            .map_or(true, |b| b.is_committed() || b.is_empty())
    }

    fn drop_fully_reaped_blocks(&mut self) {
        let reap_head = self.reap_head();
        while matches!(self.committed_blocks.front(), Some(b) if b.sequence_number < reap_head) {
            let block = self.committed_blocks.pop_front().unwrap();
            if let Some(count) = self.decrements_by_block.remove(&block.sequence_number) {
                self.pending_decrement_count = self.pending_decrement_count.saturating_sub(count);
            }
        }
    }

    /// Decrement waiters drain first - they are only ever blocked by a
    /// full journal - then increment waiters, matching
    /// `add_recovery_journal_entry`'s two-queue priority.
    fn drain_entry_waiters(&mut self) {
        loop {
            if let Some((vio_id, operation, pbn, mapping)) = self.decrement_waiters.pop_front() {
                match self.admit(vio_id, operation, pbn, mapping) {
                    Ok(EntryAdmission::Admitted(_)) => continue,
                    _ => {
                        self.decrement_waiters.push_front((vio_id, operation, pbn, mapping));
                        break;
                    }
                }
            } else if let Some((vio_id, operation, pbn, mapping)) = self.increment_waiters.pop_front() {
                match self.admit(vio_id, operation, pbn, mapping) {
                    Ok(EntryAdmission::Admitted(_)) => continue,
                    _ => {
                        self.increment_waiters.push_front((vio_id, operation, pbn, mapping));
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    pub fn suspend(&mut self) -> VdoResult<()> {
        if self.admin_state != AdminState::Normal {
            return Err(VdoError::AdminStateInvalid);
        }
        self.admin_state = AdminState::Suspending;
        self.flush();
        self.admin_state = AdminState::Saved;
        Ok(())
    }

    pub fn save(&mut self) -> VdoResult<EncodedRecoveryJournalState> {
        if self.admin_state != AdminState::Normal && self.admin_state != AdminState::Saved {
            return Err(VdoError::AdminStateInvalid);
        }
        self.admin_state = AdminState::Saving;
        self.flush();
        self.admin_state = AdminState::Saved;
        Ok(EncodedRecoveryJournalState { state: self.encode_state(), recovery_count: self.recovery_count_byte() })
    }

    pub fn resume(&mut self) -> VdoResult<()> {
        if self.admin_state != AdminState::Saved {
            return Err(VdoError::AdminStateInvalid);
        }
        self.admin_state = AdminState::Resuming;
        self.admin_state = AdminState::Normal;
        Ok(())
    }

    /// `journal_start` is `tail` only while SAVED; in every other
    /// reachable admin state it is the current reap head, matching the
    /// on-disk encoder's behavior during a live (non-saved) snapshot.
    fn encode_state(&self) -> RecoveryJournalState7_0 {
        let journal_start = if self.admin_state == AdminState::Saved { self.tail } else { self.reap_head() };
        RecoveryJournalState7_0 {
            journal_start,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_journal(write_policy: WritePolicy) -> RecoveryJournal {
        let mut journal = RecoveryJournal::new(16, write_policy);
        journal.set_recovery_count(5);
        journal
    }

    #[test]
    fn sync_policy_commits_every_entry_immediately() {
        let mut journal = new_journal(WritePolicy::Sync);
        let admission = journal
            .add_entry(VioId(1), JournalOperation::DataIncrement, 10, Some(MappingState::Uncompressed))
            .unwrap();
        assert!(matches!(admission, EntryAdmission::Admitted(_)));
        assert_eq!(journal.logical_blocks_used, 1);
    }

    #[test]
    fn journal_start_is_tail_only_when_saved() {
        let mut journal = new_journal(WritePolicy::Sync);
        journal.add_entry(VioId(1), JournalOperation::DataIncrement, 1, None).unwrap();
        let live_start = journal.encode_state().journal_start;
        assert_eq!(live_start, journal.reap_head());

        let saved = journal.save().unwrap();
        assert_eq!(saved.state.journal_start, journal.tail());
    }

    #[test]
    fn reap_heads_advance_independently() {
        let mut journal = new_journal(WritePolicy::Sync);
        let admission = journal.add_entry(VioId(1), JournalOperation::DataIncrement, 1, None).unwrap();
        let point = match admission {
            EntryAdmission::Admitted(p) => p,
            _ => panic!("expected admission"),
        };

        journal.roll_active_block_for_test();

        // Releasing only the logical-zone lock must let block_map_head
        // (gated on ZoneType::Logical) advance, even though the
        // physical-zone lock is still outstanding.
        journal.release_entry_lock(point, ZoneType::Logical);
        journal.reap_block_map_head();
        assert_eq!(journal.block_map_head(), 2);

        // slab_journal_head is gated on ZoneType::Physical only, so it
        // must not have moved yet.
        journal.reap_slab_journal_head();
        assert_eq!(journal.slab_journal_head(), 1);

        journal.release_entry_lock(point, ZoneType::Physical);
        journal.reap_slab_journal_head();
        assert_eq!(journal.slab_journal_head(), 2);
    }

    #[test]
    fn decrements_are_admitted_ahead_of_queued_increments() {
        // A journal_length of 4 makes the increment reserve-a-slot gate
        // easy to trip without filling a real 311-entry block.
        let mut journal = new_journal(WritePolicy::Sync);
        journal.journal_length = 4;

        // Manually saturate the increment gate: pretend 3 decrements are
        // already outstanding, leaving only the reserved slot free.
        journal.pending_decrement_count = 3;

        let queued = journal.add_entry(VioId(1), JournalOperation::DataIncrement, 1, None).unwrap();
        assert!(matches!(queued, EntryAdmission::Queued));

        // A decrement is gated only by available_space > 0, which still
        // holds, so it is admitted immediately even with the increment
        // stuck behind it.
        let admitted = journal.add_entry(VioId(2), JournalOperation::DataDecrement, 2, None).unwrap();
        assert!(matches!(admitted, EntryAdmission::Admitted(_)));
    }

    #[test]
    fn read_only_rejects_further_entries() {
        // Exercises the warn! logged on the read-only transition; run
        // with RUST_LOG=debug to see zone-transition and reap logging
        // while debugging a failing test.
        let _ = env_logger::builder().is_test(true).try_init();

        let mut journal = new_journal(WritePolicy::Sync);
        journal.enter_read_only();
        let result = journal.add_entry(VioId(1), JournalOperation::DataIncrement, 1, None);
        assert!(matches!(result, Err(VdoError::ReadOnly)));
    }

    #[test]
    fn recovery_count_byte_matches_stamped_value() {
        let journal = new_journal(WritePolicy::Sync);
        assert_eq!(journal.recovery_count_byte(), 5);
    }

    #[test]
    fn crossing_the_commit_threshold_requests_a_slab_journal_commit() {
        let mut journal = new_journal(WritePolicy::Sync);
        journal.slab_journal_commit_threshold = 1;
        journal.tail = 3;
        journal.slab_journal_head = 1;
        journal.check_slab_journal_commit_threshold();
        assert_eq!(journal.slab_journal_commits_requested(), 1);
    }

    impl RecoveryJournal {
        /// Test-only helper: force a block boundary without filling
        /// the real (311-entry) block, so reap tests don't need to
        /// write hundreds of entries.
        fn roll_active_block_for_test(&mut self) {
            self.roll_active_block();
        }
    }
}
