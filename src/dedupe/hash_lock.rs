//! The per-content-hash coordination record and its state machine
//! labels. The transition logic that drives a [`HashLock`] through
//! these states lives in [`crate::dedupe::hash_zone`], since most
//! transitions need the zone's lock table (to fork a new lock) or the
//! vio table (to inspect or mutate the data_vios involved); this
//! module only owns the record itself.

use std::collections::HashSet;

use crate::dedupe::pbn_lock::PbnLockHandle;
use crate::dedupe::wait_queue::WaitQueue;
use crate::types::{ChunkName, DuplicateLocation};
use crate::vio::VioId;

/// Opaque handle to a [`HashLock`] held in a hash zone's lock table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HashLockId(pub u64);

/// The hash lock's state. Most of these may be re-entered more than
/// once over a lock's lifetime (e.g. UNLOCKING -> WRITING -> UPDATING
/// -> UNLOCKING again on the stale-advice path); only QUERYING and
/// WRITING run at most once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashLockState {
    Initializing,
    Querying,
    Locking,
    Verifying,
    Deduping,
    Writing,
    Updating,
    Unlocking,
    Bypassing,
    Destroying,
}

/// One content hash's coordination state: who is acting as agent, who
/// is waiting, who currently shares the lock, and what has been
/// learned about the duplicate candidate so far.
#[derive(Debug)]
pub struct HashLock {
    pub id: HashLockId,
    pub chunk_name: ChunkName,
    pub state: HashLockState,

    /// Whether this lock is the one registered in its zone's
    /// chunk-name map. Cleared the instant a fork replaces it so a
    /// lookup by chunk name can never land on a forked-away lock.
    pub registered: bool,

    /// The single data_vio currently driving this lock's state
    /// forward, if any. `None` only while DEDUPING (every member is
    /// equally "in flight" sharing the verified duplicate).
    pub agent: Option<VioId>,

    pub waiters: WaitQueue<VioId>,

    /// Every data_vio currently bound to this lock, including the
    /// agent and all waiters. A lock is only eligible for destruction
    /// once this is empty.
    pub members: HashSet<VioId>,

    /// The duplicate candidate this lock is working with: fresh index
    /// advice, or the location this lock's own agent just wrote.
    pub duplicate: Option<DuplicateLocation>,

    /// A read lock on `duplicate`'s PBN, held from LOCKING onward
    /// (or installed directly by a write-path transfer) until
    /// UNLOCKING releases it.
    pub duplicate_lock: Option<PbnLockHandle>,

    /// Whether `duplicate` has been read back and confirmed to match.
    /// Persists across a LOCKING re-entry so a lock that already
    /// verified once does not re-verify after reacquiring its PBN
    /// lock.
    pub verified: bool,

    /// Whether this lock has already counted its first VERIFYING
    /// outcome into the zone's valid/stale advice counters. A forked
    /// or re-verified lock must not double-count.
    pub verify_counted: bool,

    /// Whether the index needs to be told about `duplicate` before
    /// this lock can be destroyed (fresh writes, or rollover).
    pub update_advice: bool,

    /// Transient result of a `lock_duplicate_pbn` call, stashed here
    /// between `start_locking` (which kicks off the collaborator call)
    /// and `finish_locking` (which reads the outcome via
    /// `continue_hash_lock`). Not meaningful outside that window.
    pub(crate) pending_pbn_lock: Option<PbnLockHandle>,
}

impl HashLock {
    pub fn new(id: HashLockId, chunk_name: ChunkName) -> Self {
        Self {
            id,
            chunk_name,
            state: HashLockState::Initializing,
            registered: true,
            agent: None,
            waiters: WaitQueue::new(),
            members: HashSet::new(),
            duplicate: None,
            duplicate_lock: None,
            verified: false,
            verify_counted: false,
            update_advice: false,
            pending_pbn_lock: None,
        }
    }

    pub fn reference_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_idle(&self) -> bool {
        self.members.is_empty()
    }
}
