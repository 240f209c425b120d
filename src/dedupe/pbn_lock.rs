//! Reference-counted read/write lock on a physical block number, with
//! claimable "increments".
//!
//! The slab depot (out of scope) owns the actual reference-count storage
//! underneath a PBN; this module is the lock the hash lock engine and
//! the write path share to coordinate access to it. Per spec §5, a
//! `PbnLock`'s `holder_count` and increment budget are the only mutable
//! state shared across zones, and mutation of it must happen only on the
//! lock's owning physical zone thread - that affinity rule is a caller
//! discipline documented here, not something the type can enforce on its
//! own (see "Global-ish PBN lock table" in the design notes).

use std::sync::{Arc, Mutex};

use crate::error::{VdoError, VdoResult};
use crate::types::{PhysicalBlockNumber, PhysicalZoneId, PbnLockType};

/// A physical block lock. Cheaply shared (`Arc<Mutex<_>>`) because
/// multiple hash_locks - each on its own hash-zone thread - may hold a
/// claimed increment from the same lock simultaneously while DEDUPING.
pub type PbnLockHandle = Arc<Mutex<PbnLock>>;

#[derive(Debug)]
pub struct PbnLock {
    pub pbn: PhysicalBlockNumber,
    pub owning_zone: PhysicalZoneId,
    lock_type: PbnLockType,
    holder_count: u32,
    /// `Some(n)` once the lock has been "upgraded to provisional": the
    /// slab reported `n` as the number of references still obtainable
    /// for this block. `None` means the block was already referenced by
    /// someone else and this lock carries no increment budget of its
    /// own.
    increment_limit: Option<u32>,
    remaining_increments: u32,
}

impl PbnLock {
    pub fn new(pbn: PhysicalBlockNumber, owning_zone: PhysicalZoneId, lock_type: PbnLockType) -> Self {
        Self {
            pbn,
            owning_zone,
            lock_type,
            holder_count: 0,
            increment_limit: None,
            remaining_increments: 0,
        }
    }

    pub fn new_shared(pbn: PhysicalBlockNumber, owning_zone: PhysicalZoneId, lock_type: PbnLockType) -> PbnLockHandle {
        Arc::new(Mutex::new(Self::new(pbn, owning_zone, lock_type)))
    }

    pub fn lock_type(&self) -> PbnLockType {
        self.lock_type
    }

    pub fn is_read_lock(&self) -> bool {
        self.lock_type == PbnLockType::Read
    }

    pub fn is_write_lock(&self) -> bool {
        self.lock_type == PbnLockType::Write
    }

    pub fn is_provisional(&self) -> bool {
        self.increment_limit.is_some()
    }

    pub fn holder_count(&self) -> u32 {
        self.holder_count
    }

    pub fn add_holder(&mut self) {
        self.holder_count += 1;
    }

    pub fn remove_holder(&mut self) {
        debug_assert!(self.holder_count > 0);
        self.holder_count = self.holder_count.saturating_sub(1);
    }

    /// Set the increment budget for a newly-provisional lock on a
    /// previously unreferenced block. Must be called from the lock's
    /// owning physical zone, and only once.
    pub fn set_increment_limit(&mut self, limit: u32) {
        debug_assert!(self.increment_limit.is_none(), "increment_limit set twice");
        self.increment_limit = Some(limit);
        self.remaining_increments = limit;
    }

    /// Atomically take one of the remaining increments. Returns `false`
    /// once the budget (or the fact that there never was one) is
    /// exhausted; the LOCKING/DEDUPING states treat that as "no more
    /// reference increments available on this PBN".
    pub fn claim_increment(&mut self) -> bool {
        if self.remaining_increments > 0 {
            self.remaining_increments -= 1;
            true
        } else {
            false
        }
    }

    pub fn remaining_increments(&self) -> u32 {
        self.remaining_increments
    }

    /// Convert a write-type lock into a read lock so a newly written
    /// block can start being shared. No-op on an already-read lock.
    pub fn downgrade_write_to_read(&mut self) -> VdoResult<()> {
        match self.lock_type {
            PbnLockType::Write => {
                self.lock_type = PbnLockType::Read;
                Ok(())
            }
            PbnLockType::Read => Ok(()),
            PbnLockType::BlockMap => {
                Err(VdoError::Other(anyhow::anyhow!("cannot downgrade a block-map lock")))
            }
        }
    }
}
